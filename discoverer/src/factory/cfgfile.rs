use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use log::{debug, error, info};
use serde_yaml::Value;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::Factory;
use crate::error::Error;

pub const CFGFILE_FACTORY: &str = "cfgfile";

const DEFAULT_PREFIX: &str = "collectbeat-";
const CONFIG_FILE_MODE: u32 = 0o644;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CfgfileConfig {
    prefix: String,
    path: String,
}

impl Default for CfgfileConfig {
    fn default() -> Self {
        CfgfileConfig {
            prefix: DEFAULT_PREFIX.to_string(),
            path: String::new(),
        }
    }
}

/// Factory strategy that materialises configs as YAML files in the directory
/// a collector engine's reloader watches. One file per fingerprint.
pub struct CfgfileFactory {
    dir: PathBuf,
    prefix: String,
    files: Mutex<HashMap<u64, PathBuf>>,
}

impl CfgfileFactory {
    /// Build the factory, create the target directory and clear any stale
    /// files left over from a previous run.
    pub async fn new(factory_config: &Document) -> Result<Self, Error> {
        let cfg: CfgfileConfig = config::unpack(factory_config)
            .map_err(|e| Error::Configuration(format!("unable to unpack cfgfile config: {}", e)))?;
        if cfg.path.is_empty() {
            return Err(Error::Configuration(
                "cfgfile factory needs a `path` pointing at the reloader's config glob"
                    .to_string(),
            ));
        }

        let dir = target_dir(&cfg.path);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Configuration(format!("unable to create config dir: {}", e)))?;

        let factory = CfgfileFactory {
            dir,
            prefix: cfg.prefix,
            files: Mutex::new(HashMap::new()),
        };
        factory.clean_directory().await?;
        Ok(factory)
    }

    /// Remove every file from a previous run. Only files carrying our prefix
    /// and the `.yml` extension are touched.
    async fn clean_directory(&self) -> Result<(), Error> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Configuration(format!("unable to read config dir: {}", e)))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            self.delete_file(&entry.path()).await;
        }
        Ok(())
    }

    async fn delete_file(&self, file: &Path) {
        let name = match file.file_name().and_then(|name| name.to_str()) {
            Some(name) => name,
            None => return,
        };
        if !name.starts_with(&self.prefix) || !name.ends_with(".yml") {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(file).await {
            error!("unable to delete file {}: {}", file.display(), e);
        }
    }

    fn file_for(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{}{}.yml", self.prefix, id))
    }

    /// Config files hold an array of module configs; single-module documents
    /// get wrapped.
    fn render(holder: &ConfigHolder) -> Result<String, Error> {
        let doc = match &holder.config {
            Value::Sequence(_) => holder.config.clone(),
            other => Value::Sequence(vec![other.clone()]),
        };
        serde_yaml::to_string(&doc)
            .map_err(|e| Error::Factory(format!("unable to render config: {}", e)))
    }

    /// Deployed file paths, keyed by fingerprint.
    pub async fn deployed_files(&self) -> HashMap<u64, PathBuf> {
        self.files.lock().await.clone()
    }
}

/// The directory behind a reloader path such as `./prospectors.d/*.yml`.
/// Plain directory paths are used as-is.
fn target_dir(path: &str) -> PathBuf {
    let path = Path::new(path);
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if file_name.contains('*') || file_name.ends_with(".yml") {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl Factory for CfgfileFactory {
    async fn start(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
        for holder in holders {
            if holder.is_empty() {
                continue;
            }
            let id = holder.fingerprint();
            if self.files.lock().await.contains_key(&id) {
                debug!("start - config file {} already deployed", id);
                continue;
            }

            let body = Self::render(holder)?;
            let file = self.file_for(id);
            debug!("start - creating file {}", file.display());
            tokio::fs::write(&file, body.as_bytes())
                .await
                .map_err(|e| Error::Factory(format!("unable to write cfgfile: {}", e)))?;
            let mut permissions = tokio::fs::metadata(&file)
                .await
                .map_err(|e| Error::Factory(format!("unable to stat cfgfile: {}", e)))?
                .permissions();
            permissions.set_mode(CONFIG_FILE_MODE);
            tokio::fs::set_permissions(&file, permissions)
                .await
                .map_err(|e| Error::Factory(format!("unable to chmod cfgfile: {}", e)))?;

            self.files.lock().await.insert(id, file);
            info!("start - deployed config file {}", id);
        }
        Ok(())
    }

    async fn stop(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
        for holder in holders {
            if holder.is_empty() {
                continue;
            }
            let id = holder.fingerprint();
            let file = match self.files.lock().await.get(&id).cloned() {
                Some(file) => file,
                None => {
                    debug!("stop - fingerprint {} not deployed", id);
                    continue;
                }
            };
            self.delete_file(&file).await;
            self.files.lock().await.remove(&id);
            info!("stop - removed config file {}", id);
        }
        Ok(())
    }

    async fn restart(&self, old: &ConfigHolder, new: &ConfigHolder) -> Result<(), Error> {
        let old_id = old.fingerprint();
        let new_id = new.fingerprint();
        if old_id == new_id && self.files.lock().await.contains_key(&old_id) {
            debug!("restart - configs unchanged, keeping file {}", old_id);
            return Ok(());
        }

        self.stop(std::slice::from_ref(old)).await?;
        self.start(std::slice::from_ref(new)).await
    }

    async fn stop_all(&self) {
        let mut files = self.files.lock().await;
        for (id, file) in files.drain() {
            self.delete_file(&file).await;
            info!("stop_all - removed config file {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn holder(yaml: &str) -> ConfigHolder {
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        ConfigHolder::new(doc)
    }

    async fn factory_for(dir: &Path) -> CfgfileFactory {
        let factory_config: Document =
            serde_yaml::from_str(&format!("{{name: cfgfile, path: {}/*.yml}}", dir.display()))
                .unwrap();
        CfgfileFactory::new(&factory_config).await.unwrap()
    }

    fn dir_listing(dir: &Path) -> HashSet<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_cold_start_removes_stale_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("collectbeat-111.yml"), "stale").unwrap();
        std::fs::write(dir.path().join("other.yml"), "keep").unwrap();

        factory_for(dir.path()).await;

        let listing = dir_listing(dir.path());
        assert!(!listing.contains("collectbeat-111.yml"));
        assert!(listing.contains("other.yml"));
    }

    #[tokio::test]
    async fn test_start_and_stop_materialise_files() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path()).await;
        let holders = vec![holder("{module: prometheus, hosts: [1.2.3.4:8080]}")];
        let id = holders[0].fingerprint();

        factory.start(&holders).await.unwrap();
        let expected = format!("collectbeat-{}.yml", id);
        assert!(dir_listing(dir.path()).contains(&expected));

        // The materialised document is an array of module configs.
        let written = std::fs::read_to_string(dir.path().join(&expected)).unwrap();
        let parsed: Document = serde_yaml::from_str(&written).unwrap();
        assert!(parsed.as_sequence().is_some());

        factory.stop(&holders).await.unwrap();
        assert!(!dir_listing(dir.path()).contains(&expected));
        // Stopping an unknown fingerprint is a no-op.
        factory.stop(&holders).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_set_matches_tracked_fingerprints() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path()).await;
        let first = holder("{module: prometheus, hosts: [1.2.3.4:8080]}");
        let second = holder("{module: jolokia, hosts: [1.2.3.4:8778]}");

        factory.start(&[first.clone(), second.clone()]).await.unwrap();

        let tracked: HashSet<String> = factory
            .deployed_files()
            .await
            .keys()
            .map(|id| format!("collectbeat-{}.yml", id))
            .collect();
        assert_eq!(tracked, dir_listing(dir.path()));

        factory.stop(std::slice::from_ref(&first)).await.unwrap();
        let tracked: HashSet<String> = factory
            .deployed_files()
            .await
            .keys()
            .map(|id| format!("collectbeat-{}.yml", id))
            .collect();
        assert_eq!(tracked, dir_listing(dir.path()));
    }

    #[tokio::test]
    async fn test_restart_identical_fingerprint_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path()).await;
        let active = holder("{module: prometheus, hosts: [1.2.3.4:8080]}");

        factory.start(std::slice::from_ref(&active)).await.unwrap();
        let file = dir.path().join(format!("collectbeat-{}.yml", active.fingerprint()));
        let before = std::fs::metadata(&file).unwrap().modified().unwrap();

        factory.restart(&active, &active.clone()).await.unwrap();
        let after = std::fs::metadata(&file).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_restart_changed_fingerprint_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path()).await;
        let old = holder("{module: prometheus, hosts: [1.2.3.4:8080]}");
        let new = holder("{module: prometheus, hosts: [1.2.3.4:9090]}");

        factory.start(std::slice::from_ref(&old)).await.unwrap();
        factory.restart(&old, &new).await.unwrap();

        let listing = dir_listing(dir.path());
        assert!(!listing.contains(&format!("collectbeat-{}.yml", old.fingerprint())));
        assert!(listing.contains(&format!("collectbeat-{}.yml", new.fingerprint())));
    }

    #[tokio::test]
    async fn test_stop_all_clears_directory() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory_for(dir.path()).await;
        std::fs::write(dir.path().join("foreign.txt"), "keep").unwrap();

        factory
            .start(&[
                holder("{module: prometheus, hosts: [1.2.3.4:8080]}"),
                holder("{module: jolokia, hosts: [1.2.3.4:8778]}"),
            ])
            .await
            .unwrap();
        factory.stop_all().await;

        assert_eq!(
            dir_listing(dir.path()),
            HashSet::from(["foreign.txt".to_string()])
        );
    }
}
