use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use collectbeat_shared::runtime::{ContainerInfo, DockerRuntime, RuntimeConfig, RuntimeInterface};
use log::error;
use serde_yaml::Value;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::appender::Appender;
use crate::error::Error;

pub const LOG_PATH_APPENDER: &str = "log_path";

const OVERLAY: &str = "overlay";
const OVERLAY2: &str = "overlay2";
const AUFS: &str = "aufs";
const DEVICE_MAPPER: &str = "devicemapper";

/// Rewrites custom log paths to their location on the host filesystem by
/// resolving each container's storage-driver root through the runtime client.
pub struct LogPathAppender {
    runtime: Arc<dyn RuntimeInterface>,
    root_dir: String,
    alive: OnceCell<bool>,
}

pub fn new_appender(appender_config: &Document) -> Result<Box<dyn Appender>, Error> {
    let cfg: RuntimeConfig = config::unpack(appender_config).map_err(|e| {
        Error::Configuration(format!(
            "fail to unpack the `log_path` appender configuration: {}",
            e
        ))
    })?;
    let runtime = DockerRuntime::new(&cfg)
        .map_err(|e| Error::Configuration(format!("unable to create runtime client: {}", e)))?;
    Ok(Box::new(LogPathAppender::with_runtime(
        Arc::new(runtime),
        cfg.root_dir,
    )))
}

impl LogPathAppender {
    pub fn with_runtime(runtime: Arc<dyn RuntimeInterface>, root_dir: String) -> Self {
        LogPathAppender {
            runtime,
            root_dir,
            alive: OnceCell::new(),
        }
    }

    /// One-shot liveness probe of the runtime endpoint. A dead runtime
    /// disables the appender for the rest of the process.
    async fn alive(&self) -> bool {
        *self
            .alive
            .get_or_init(|| async {
                match self.runtime.info().await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("append - container runtime is not reachable: {}", e);
                        false
                    }
                }
            })
            .await
    }

    async fn storage_prefix(&self, cid: &str, info: &ContainerInfo) -> Option<String> {
        let graph = &info.graph_driver;
        match info.driver.as_str() {
            driver @ (OVERLAY | OVERLAY2) => {
                if graph.name != driver {
                    return None;
                }
                graph.data.get("MergedDir").cloned()
            }
            AUFS => {
                if graph.name != AUFS {
                    return None;
                }
                let mount_id_path = format!(
                    "{}/image/aufs/layerdb/mounts/{}/mount-id",
                    self.root_dir, cid
                );
                let fs_id = match tokio::fs::read_to_string(&mount_id_path).await {
                    Ok(fs_id) => fs_id,
                    Err(e) => {
                        error!("append - unable to read file {}: {}", mount_id_path, e);
                        return None;
                    }
                };
                if fs_id.is_empty() {
                    error!("append - unable to find filesystem id for container {}", cid);
                    return None;
                }
                Some(format!("{}/aufs/mnt/{}", self.root_dir, fs_id))
            }
            DEVICE_MAPPER => {
                if graph.name != DEVICE_MAPPER {
                    return None;
                }
                let device_name = graph.data.get("DeviceName")?;
                let fs_id = device_name.rsplit('-').next()?;
                Some(format!(
                    "{}/devicemapper/mnt/{}/rootfs",
                    self.root_dir, fs_id
                ))
            }
            other => {
                error!("append - unsupported storage driver {}", other);
                None
            }
        }
    }
}

#[async_trait]
impl Appender for LogPathAppender {
    async fn append(&self, holder: &mut ConfigHolder) {
        // Only holders carrying custom log paths need rewriting.
        if holder.meta.is_empty() {
            return;
        }
        if !self.alive().await {
            return;
        }

        for (cid, declared_paths) in &holder.meta {
            if declared_paths.is_empty() {
                continue;
            }
            let info = match self.runtime.inspect_container(cid).await {
                Ok(info) => info,
                Err(e) => {
                    error!(
                        "append - unable to get container info for container {}: {}",
                        cid, e
                    );
                    continue;
                }
            };
            let Some(prefix) = self.storage_prefix(cid, &info).await else {
                continue;
            };
            rewrite_paths(&mut holder.config, declared_paths, &prefix);
        }
    }
}

/// Prepend the storage prefix to the `paths` of every config whose paths
/// match the pod's declared list exactly.
fn rewrite_paths(doc: &mut Document, declared: &[String], prefix: &str) {
    match doc {
        Value::Sequence(configs) => {
            for entry in configs {
                rewrite_single(entry, declared, prefix);
            }
        }
        other => rewrite_single(other, declared, prefix),
    }
}

fn rewrite_single(doc: &mut Document, declared: &[String], prefix: &str) {
    let Some(paths) = config::get(doc, "paths").and_then(Document::as_sequence) else {
        return;
    };
    let current: Vec<&str> = paths.iter().filter_map(Value::as_str).collect();
    if current != declared.iter().map(String::as_str).collect::<Vec<_>>() {
        return;
    }

    let rewritten: Vec<Value> = declared
        .iter()
        .map(|path| Value::String(format!("{}{}", prefix, path)))
        .collect();
    config::set(doc, "paths", Value::Sequence(rewritten));
}
