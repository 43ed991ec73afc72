use async_trait::async_trait;
use collectbeat_shared::config::ConfigHolder;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Factory, Runner, RunnerFactory};
use crate::error::Error;

pub const RUNNER_FACTORY: &str = "runner";

/// Factory strategy that owns live collector instances, created through an
/// injected runner factory and kept in a fingerprint-keyed table.
pub struct InProcessFactory {
    factory: Arc<dyn RunnerFactory>,
    runners: Mutex<HashMap<u64, Box<dyn Runner>>>,
}

impl InProcessFactory {
    pub fn new(factory: Arc<dyn RunnerFactory>) -> Self {
        InProcessFactory {
            factory,
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn create_runner(&self, holder: &ConfigHolder) -> Result<Box<dyn Runner>, Error> {
        self.factory
            .create(&holder.config)
            .map_err(|e| Error::Factory(format!("unable to create module runner: {}", e)))
    }

    /// Fingerprints currently backed by a live runner.
    pub async fn active_fingerprints(&self) -> Vec<u64> {
        self.runners.lock().await.keys().copied().collect()
    }
}

#[async_trait]
impl Factory for InProcessFactory {
    async fn start(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
        for holder in holders {
            if holder.is_empty() {
                continue;
            }
            let id = holder.fingerprint();
            if self.runners.lock().await.contains_key(&id) {
                debug!("start - runner {} already active", id);
                continue;
            }
            // Runner creation touches no shared state; only the table
            // insertion happens under the lock.
            let runner = self.create_runner(holder)?;
            runner.start();
            info!("start - starting runner {}", id);
            self.runners.lock().await.insert(id, runner);
        }
        Ok(())
    }

    async fn stop(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
        for holder in holders {
            if holder.is_empty() {
                continue;
            }
            let id = holder.fingerprint();
            if let Some(runner) = self.runners.lock().await.remove(&id) {
                runner.stop();
                info!("stop - stopping runner {}", id);
            }
        }
        Ok(())
    }

    async fn restart(&self, old: &ConfigHolder, new: &ConfigHolder) -> Result<(), Error> {
        let old_id = old.fingerprint();
        let new_id = new.fingerprint();

        if old_id == new_id && self.runners.lock().await.contains_key(&old_id) {
            debug!("restart - configs unchanged, not restarting {}", old_id);
            return Ok(());
        }

        if let Some(runner) = self.runners.lock().await.remove(&old_id) {
            runner.stop();
            info!("restart - stopping old runner {}", old_id);
        }

        if new.is_empty() {
            return Ok(());
        }
        let runner = self.create_runner(new)?;
        runner.start();
        info!("restart - starting new runner {}", new_id);
        self.runners.lock().await.insert(new_id, runner);
        Ok(())
    }

    async fn stop_all(&self) {
        let mut runners = self.runners.lock().await;
        for (id, runner) in runners.drain() {
            runner.stop();
            info!("stop_all - stopping runner {}", id);
        }
    }
}
