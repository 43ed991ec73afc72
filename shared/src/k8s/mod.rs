use anyhow::Context;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::client::Client;
use kube::config::{Config, KubeConfigOptions, Kubeconfig};
use log::trace;
use mockall::automock;

pub mod pod;

/// A snapshot of the pods scheduled on a node, together with the list
/// resource version the watch can continue from.
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub items: Vec<Pod>,
    pub resource_version: Option<String>,
}

/// A live stream of pod watch events.
pub type PodEventStream = BoxStream<'static, anyhow::Result<WatchEvent<Pod>>>;

/// The cluster operations the discovery pipeline consumes. Mocked in tests so
/// no component above this trait ever talks to a real API server.
#[automock]
#[async_trait]
pub trait KubeInterface: Send + Sync {
    async fn list_pods_on_node(&self, node: &str) -> Result<PodList, anyhow::Error>;
    async fn watch_pods_on_node(
        &self,
        node: &str,
        resource_version: &str,
    ) -> Result<PodEventStream, anyhow::Error>;
    async fn find_pod(&self, name: &str, namespace: &str) -> Result<Pod, anyhow::Error>;
    async fn find_secret(&self, name: &str, namespace: &str) -> Result<Secret, anyhow::Error>;
}

fn node_field_selector(node: &str) -> String {
    format!("spec.nodeName={}", node)
}

#[derive(Clone)]
pub struct KubeImpl {
    client: Client,
}

impl KubeImpl {
    /// Create a client from the in-cluster service account (or the ambient
    /// kubeconfig when running outside a cluster).
    pub async fn new() -> Result<Self, anyhow::Error> {
        Ok(KubeImpl {
            client: Client::try_default().await?,
        })
    }

    /// Create a client from an operator-supplied kubeconfig file.
    pub async fn from_kubeconfig(path: &str) -> Result<Self, anyhow::Error> {
        let kubeconfig = Kubeconfig::read_from(path)
            .with_context(|| format!("read kubeconfig {}", path))?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        Ok(KubeImpl {
            client: Client::try_from(config)?,
        })
    }

    pub fn get_kube_client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl KubeInterface for KubeImpl {
    async fn list_pods_on_node(&self, node: &str) -> Result<PodList, anyhow::Error> {
        trace!("list_pods_on_node - node {}", node);
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&node_field_selector(node));
        let list = pods.list(&params).await?;
        Ok(PodList {
            resource_version: list.metadata.resource_version.clone(),
            items: list.items,
        })
    }

    async fn watch_pods_on_node(
        &self,
        node: &str,
        resource_version: &str,
    ) -> Result<PodEventStream, anyhow::Error> {
        trace!(
            "watch_pods_on_node - node {} from resource version {}",
            node,
            resource_version
        );
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = WatchParams::default().fields(&node_field_selector(node));
        let stream = pods.watch(&params, resource_version).await?;
        Ok(stream.map_err(anyhow::Error::from).boxed())
    }

    async fn find_pod(&self, name: &str, namespace: &str) -> Result<Pod, anyhow::Error> {
        trace!("find_pod - {}/{}", namespace, name);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn find_secret(&self, name: &str, namespace: &str) -> Result<Secret, anyhow::Error> {
        trace!("find_secret - {}/{}", namespace, name);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(secrets.get(name).await?)
    }
}
