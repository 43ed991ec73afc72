use anyhow::Context;
use log::info;
use std::future::Future;
use tokio::process::Command;

/// The external collector engine a subcommand wraps, e.g. the filebeat or
/// metricbeat binary pointed at the materialised config directory.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Supervise the engine process: run it until it exits or the shutdown
/// future resolves, and never leave the child behind.
pub async fn supervise(
    engine_config: &EngineConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    info!("supervise - starting engine {}", engine_config.path);
    let mut child = Command::new(&engine_config.path)
        .args(&engine_config.args)
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("unable to start engine {}", engine_config.path))?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                info!("supervise - engine exited cleanly");
                Ok(())
            } else {
                Err(anyhow::anyhow!("engine exited with status {}", status))
            }
        }
        _ = shutdown => {
            info!("supervise - shutting engine down");
            let _ = child.start_kill();
            let _ = child.wait().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[tokio::test]
    async fn test_engine_clean_exit() {
        let engine_config = EngineConfig {
            path: "true".to_string(),
            args: vec![],
        };
        assert!(supervise(&engine_config, pending()).await.is_ok());
    }

    #[tokio::test]
    async fn test_engine_failure_is_reported() {
        let engine_config = EngineConfig {
            path: "false".to_string(),
            args: vec![],
        };
        assert!(supervise(&engine_config, pending()).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_engine_binary_is_an_error() {
        let engine_config = EngineConfig {
            path: "/nonexistent/engine".to_string(),
            args: vec![],
        };
        assert!(supervise(&engine_config, pending()).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_kills_engine() {
        let engine_config = EngineConfig {
            path: "sleep".to_string(),
            args: vec!["30".to_string()],
        };
        let started = std::time::Instant::now();
        assert!(supervise(&engine_config, std::future::ready(())).await.is_ok());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
