use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use log::trace;
use mockall::automock;
use std::collections::HashMap;

const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_ROOT_DIR: &str = "/var/lib/docker";
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Container runtime client settings, as the log-path appender accepts them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host: String,
    pub root_dir: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            host: DEFAULT_DOCKER_HOST.to_string(),
            root_dir: DEFAULT_ROOT_DIR.to_string(),
        }
    }
}

/// Storage driver details for a running container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDriverInfo {
    pub name: String,
    pub data: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerInfo {
    pub driver: String,
    pub graph_driver: GraphDriverInfo,
}

/// The container runtime operations the log-path appender consumes.
#[automock]
#[async_trait]
pub trait RuntimeInterface: Send + Sync {
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, anyhow::Error>;
    async fn info(&self) -> Result<(), anyhow::Error>;
}

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(config: &RuntimeConfig) -> Result<Self, anyhow::Error> {
        let client = if config.host.starts_with("unix://") {
            Docker::connect_with_unix(&config.host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(&config.host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        };
        Ok(DockerRuntime { client })
    }
}

#[async_trait]
impl RuntimeInterface for DockerRuntime {
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, anyhow::Error> {
        trace!("inspect_container - {}", id);
        let response = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        let graph_driver = response
            .graph_driver
            .map(|driver| GraphDriverInfo {
                name: driver.name,
                data: driver.data,
            })
            .unwrap_or_default();
        Ok(ContainerInfo {
            driver: response.driver.unwrap_or_default(),
            graph_driver,
        })
    }

    async fn info(&self) -> Result<(), anyhow::Error> {
        self.client.info().await?;
        Ok(())
    }
}
