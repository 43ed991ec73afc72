use collectbeat_shared::config::{self, Document};
use collectbeat_shared::k8s::{pod, KubeInterface};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use log::{error, info, trace, warn};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::builder::MetadataProvider;
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::stopper::Stopper;

const POD_QUEUE_CAPACITY: usize = 10;
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns the cluster's best-effort pod stream into a clean per-pod lifecycle
/// for one node: list+watch, dedup by UID and resource version, and a single
/// worker that drives the pipeline so per-pod events stay ordered.
pub struct PodWatcher {
    kube: Arc<dyn KubeInterface>,
    node: String,
    retry_period: Duration,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    pods: RwLock<HashMap<String, Pod>>,
    metadata: RwLock<HashMap<String, Document>>,
    last_resource_version: Mutex<String>,
    stopper: Stopper,
}

impl PodWatcher {
    pub fn new(kube: Arc<dyn KubeInterface>, node: String, retry_period: Duration) -> Self {
        PodWatcher {
            kube,
            node,
            retry_period,
            pipeline: RwLock::new(None),
            pods: RwLock::new(HashMap::new()),
            metadata: RwLock::new(HashMap::new()),
            last_resource_version: Mutex::new("0".to_string()),
            stopper: Stopper::new(),
        }
    }

    pub fn set_pipeline(&self, pipeline: Arc<Pipeline>) {
        *self.pipeline.write().unwrap() = Some(pipeline);
    }

    fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.pipeline.read().unwrap().clone()
    }

    /// Start the worker, run the initial sync and, once the sync finished
    /// inside the ready window, keep watching in the background. The queue's
    /// senders live in the sync and watch tasks only, so cancellation closes
    /// the queue and the worker drains what is left.
    pub async fn run(self: &Arc<Self>) -> Result<(), Error> {
        let (queue_tx, queue_rx) = mpsc::channel(POD_QUEUE_CAPACITY);

        let worker = self.clone();
        tokio::spawn(async move { worker.worker(queue_rx).await });

        match timeout(READY_TIMEOUT, self.sync_pods(&queue_tx)).await {
            Err(_) => {
                warn!("run - pod sync did not finish within {:?}", READY_TIMEOUT);
                self.stop();
                return Err(Error::NotReady);
            }
            Ok(Err(e)) => {
                // The watch loop replays from the last resource version, so a
                // failed first list is not fatal.
                error!("run - pod sync failed: {}", e);
            }
            Ok(Ok(())) => {}
        }

        let watcher = self.clone();
        tokio::spawn(async move { watcher.watch_pods(queue_tx).await });
        Ok(())
    }

    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn get_pod(&self, uid: &str) -> Option<Pod> {
        self.pods.read().unwrap().get(uid).cloned()
    }

    async fn sync_pods(&self, queue: &mpsc::Sender<Pod>) -> Result<(), anyhow::Error> {
        info!("sync_pods - performing a pod sync");
        let snapshot = self.kube.list_pods_on_node(&self.node).await?;
        if let Some(resource_version) = snapshot.resource_version {
            *self.last_resource_version.lock().unwrap() = resource_version;
        }
        for pod in snapshot.items {
            queue.send(pod).await?;
        }
        info!("sync_pods - pod sync done");
        Ok(())
    }

    async fn watch_pods(self: Arc<Self>, queue: mpsc::Sender<Pod>) {
        loop {
            if self.stopper.is_stopped() {
                return;
            }
            info!("watch_pods - watching API for pod events");
            let resource_version = self.last_resource_version.lock().unwrap().clone();
            let mut stream = match self
                .kube
                .watch_pods_on_node(&self.node, &resource_version)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    error!("watch_pods - watching API error {}", e);
                    if !self.backoff().await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = self.stopper.stopped() => return,
                    event = stream.next() => match event {
                        Some(Ok(WatchEvent::Added(pod)))
                        | Some(Ok(WatchEvent::Modified(pod)))
                        | Some(Ok(WatchEvent::Deleted(pod))) => {
                            if let Some(resource_version) = pod::pod_resource_version(&pod) {
                                *self.last_resource_version.lock().unwrap() =
                                    resource_version.to_string();
                            }
                            if queue.send(pod).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            *self.last_resource_version.lock().unwrap() =
                                bookmark.metadata.resource_version.clone();
                        }
                        Some(Ok(WatchEvent::Error(e))) => {
                            // Stale resource versions surface here; restart
                            // the watch from scratch.
                            error!("watch_pods - watching API error {}", e);
                            *self.last_resource_version.lock().unwrap() = "0".to_string();
                            if !self.backoff().await {
                                return;
                            }
                            break;
                        }
                        Some(Err(e)) => {
                            error!("watch_pods - watching API error {}", e);
                            if !self.backoff().await {
                                return;
                            }
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Sleep out the retry period; false when stopped while sleeping.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.stopper.stopped() => false,
            _ = tokio::time::sleep(self.retry_period) => true,
        }
    }

    async fn worker(self: Arc<Self>, mut queue: mpsc::Receiver<Pod>) {
        loop {
            tokio::select! {
                _ = self.stopper.stopped() => return,
                pod = queue.recv() => match pod {
                    Some(pod) => self.dispatch(pod).await,
                    None => return,
                }
            }
        }
    }

    async fn dispatch(&self, pod: Pod) {
        let Some(uid) = pod::pod_uid(&pod).map(str::to_string) else {
            warn!("dispatch - dropping pod without a UID");
            return;
        };

        if pod::is_terminating(&pod) {
            self.on_pod_delete(&uid).await;
            return;
        }

        let known_resource_version = self
            .pods
            .read()
            .unwrap()
            .get(&uid)
            .and_then(|known| pod::pod_resource_version(known).map(str::to_string));

        match known_resource_version {
            None => self.on_pod_add(uid, pod).await,
            Some(known) if Some(known.as_str()) != pod::pod_resource_version(&pod) => {
                // Updates replay as delete+add so every builder re-derives
                // its configs from the new pod body.
                self.on_pod_delete(&uid).await;
                self.on_pod_add(uid, pod).await;
            }
            Some(_) => {
                trace!("dispatch - dropping spurious notification for pod {}", uid);
            }
        }
    }

    async fn on_pod_add(&self, uid: String, pod: Pod) {
        trace!("on_pod_add - pod {}", uid);
        {
            let mut metadata = self.metadata.write().unwrap();
            for (key, enrichment) in index_pod(&pod) {
                metadata.insert(key, enrichment);
            }
        }
        self.pods.write().unwrap().insert(uid, pod.clone());

        let Some(pipeline) = self.pipeline() else {
            error!("on_pod_add - no pipeline attached");
            return;
        };
        pipeline.start_module_runners(&pod).await;
    }

    /// Deletions tear down against the previously stored pod body: the
    /// inbound notification may be a tombstone without IP or statuses.
    async fn on_pod_delete(&self, uid: &str) {
        let Some(stored) = self.pods.write().unwrap().remove(uid) else {
            return;
        };
        trace!("on_pod_delete - pod {}", uid);
        {
            let mut metadata = self.metadata.write().unwrap();
            for (key, _) in index_pod(&stored) {
                metadata.remove(&key);
            }
        }

        let Some(pipeline) = self.pipeline() else {
            error!("on_pod_delete - no pipeline attached");
            return;
        };
        pipeline.stop_module_runners(&stored).await;
    }
}

impl MetadataProvider for PodWatcher {
    fn get_metadata(&self, key: &str) -> Option<Document> {
        self.metadata.read().unwrap().get(key).cloned()
    }
}

/// Enrichment entries for a pod, keyed by its IP and every `ip:port` pair its
/// containers declare.
fn index_pod(pod: &Pod) -> Vec<(String, Document)> {
    let Some(ip) = pod::pod_ip(pod).filter(|ip| !ip.is_empty()) else {
        return Vec::new();
    };

    let mut enrichment = config::empty();
    config::set(
        &mut enrichment,
        "namespace",
        Value::String(pod::pod_namespace(pod).to_string()),
    );
    config::set(
        &mut enrichment,
        "pod",
        Value::String(pod::pod_name(pod).to_string()),
    );
    if let Some(node) = pod::pod_node_name(pod) {
        config::set(&mut enrichment, "node", Value::String(node.to_string()));
    }
    if let Some(labels) = &pod.metadata.labels {
        let mut labels_doc = config::empty();
        for (key, value) in labels {
            config::set(&mut labels_doc, key, Value::String(value.clone()));
        }
        config::set(&mut enrichment, "labels", labels_doc);
    }

    let mut entries = vec![(ip.to_string(), enrichment.clone())];
    for port in pod::container_ports(pod) {
        entries.push((format!("{}:{}", ip, port), enrichment.clone()));
    }
    entries
}
