use async_trait::async_trait;
use collectbeat_shared::config::{ConfigHolder, Document};
use collectbeat_shared::k8s::KubeInterface;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;

use crate::error::Error;

/// Cluster client handles handed to builder constructors.
#[derive(Clone)]
pub struct ClientInfo {
    pub kube: Arc<dyn KubeInterface>,
}

/// Read access to the watcher's enrichment table. Builders use it to attach
/// cluster-identity labels to the configs they emit.
pub trait MetadataProvider: Send + Sync {
    fn get_metadata(&self, key: &str) -> Option<Document>;
}

/// A poll-style builder: every call derives the full desired set of configs
/// for one pod from scratch.
#[async_trait]
pub trait PollerBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn build_module_configs(&self, pod: &Pod) -> Vec<ConfigHolder>;
}

/// A push-style builder accumulates state across all pods and answers with
/// the new full desired config after every mutation.
///
/// Removing a pod that was never added is a no-op, and an add followed by the
/// matching remove restores the config that preceded the add.
pub trait PushBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fold the pod into the accumulated state and return the new full config.
    fn add_module_config(&self, pod: &Pod) -> Option<ConfigHolder>;

    /// Strip the pod from the accumulated state and return the new full config.
    fn remove_module_config(&self, pod: &Pod) -> Option<ConfigHolder>;

    /// The current full config.
    fn module_config(&self) -> Option<ConfigHolder>;
}

/// The two builder capabilities the pipeline dispatches on.
pub enum Builder {
    Poller(Box<dyn PollerBuilder>),
    Push(Box<dyn PushBuilder>),
}

impl Builder {
    pub fn name(&self) -> &'static str {
        match self {
            Builder::Poller(builder) => builder.name(),
            Builder::Push(builder) => builder.name(),
        }
    }
}

pub type BuilderConstructor =
    fn(&Document, &ClientInfo, Arc<dyn MetadataProvider>) -> Result<Builder, Error>;
