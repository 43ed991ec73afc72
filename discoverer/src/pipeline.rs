use collectbeat_shared::config::ConfigHolder;
use collectbeat_shared::k8s::pod;
use k8s_openapi::api::core::v1::Pod;
use log::{error, trace, warn};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

use crate::appender::Appender;
use crate::builder::Builder;
use crate::factory::Factory;

struct Inner {
    builders: Vec<Builder>,
    appenders: Vec<Box<dyn Appender>>,
}

/// Fans a pod event out over every registered builder, applies the appender
/// passes to each draft config, and hands the results to the factory.
///
/// A shared lock spans the whole dispatch so the builder and appender lists
/// cannot change mid-event. The factory is attached when discovery starts.
pub struct Pipeline {
    factory: StdRwLock<Option<Arc<dyn Factory>>>,
    inner: RwLock<Inner>,
}

impl Pipeline {
    pub fn new(builders: Vec<Builder>, appenders: Vec<Box<dyn Appender>>) -> Self {
        Pipeline {
            factory: StdRwLock::new(None),
            inner: RwLock::new(Inner {
                builders,
                appenders,
            }),
        }
    }

    pub fn set_factory(&self, factory: Arc<dyn Factory>) {
        *self.factory.write().unwrap() = Some(factory);
    }

    fn factory(&self) -> Option<Arc<dyn Factory>> {
        self.factory.read().unwrap().clone()
    }

    /// Derive and deploy the collector configs a pod calls for.
    pub async fn start_module_runners(&self, pod: &Pod) {
        let Some(factory) = self.factory() else {
            warn!("start_module_runners - no factory attached, dropping event");
            return;
        };
        let inner = self.inner.read().await;

        for builder in &inner.builders {
            match builder {
                Builder::Poller(poller) => {
                    let mut holders = poller.build_module_configs(pod).await;
                    append_all(&inner.appenders, &mut holders).await;
                    if let Err(e) = factory.start(&holders).await {
                        error!("module start up failed due to error {}", e);
                    }
                }
                Builder::Push(push) => {
                    let old = push.module_config();
                    let new = push.add_module_config(pod);
                    let (Some(mut old), Some(mut new)) = (old, new) else {
                        error!(
                            "start_module_runners - builder {} yielded no config",
                            builder.name()
                        );
                        continue;
                    };
                    append_one(&inner.appenders, &mut old).await;
                    append_one(&inner.appenders, &mut new).await;
                    if let Err(e) = factory.restart(&old, &new).await {
                        error!("unable to restart module due to error {}", e);
                    }
                }
            }
        }
    }

    /// Tear down the collector configs a disappearing pod was responsible for.
    pub async fn stop_module_runners(&self, pod: &Pod) {
        let Some(factory) = self.factory() else {
            warn!("stop_module_runners - no factory attached, dropping event");
            return;
        };
        let inner = self.inner.read().await;
        trace!("stop_module_runners - pod {}", pod::pod_name(pod));

        for builder in &inner.builders {
            match builder {
                Builder::Poller(poller) => {
                    let mut holders = poller.build_module_configs(pod).await;
                    append_all(&inner.appenders, &mut holders).await;
                    if let Err(e) = factory.stop(&holders).await {
                        error!("module stop failed due to error {}", e);
                    }
                }
                Builder::Push(push) => {
                    let old = push.module_config();
                    let new = push.remove_module_config(pod);
                    let (Some(mut old), Some(mut new)) = (old, new) else {
                        error!(
                            "stop_module_runners - builder {} yielded no config",
                            builder.name()
                        );
                        continue;
                    };
                    append_one(&inner.appenders, &mut old).await;
                    append_one(&inner.appenders, &mut new).await;
                    if let Err(e) = factory.restart(&old, &new).await {
                        error!("unable to restart module due to error {}", e);
                    }
                }
            }
        }
    }
}

async fn append_all(appenders: &[Box<dyn Appender>], holders: &mut [ConfigHolder]) {
    for holder in holders {
        append_one(appenders, holder).await;
    }
}

async fn append_one(appenders: &[Box<dyn Appender>], holder: &mut ConfigHolder) {
    for appender in appenders {
        appender.append(holder).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::Appender;
    use crate::builder::{PollerBuilder, PushBuilder};
    use crate::error::Error;
    use async_trait::async_trait;
    use collectbeat_shared::config::{self, Document};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_yaml::Value;
    use std::sync::Mutex;

    /// Factory double that records every call it sees.
    #[derive(Default)]
    pub struct RecordingFactory {
        pub events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Factory for RecordingFactory {
        async fn start(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
            for holder in holders {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("start:{}", holder.fingerprint()));
            }
            Ok(())
        }

        async fn stop(&self, holders: &[ConfigHolder]) -> Result<(), Error> {
            for holder in holders {
                self.events
                    .lock()
                    .unwrap()
                    .push(format!("stop:{}", holder.fingerprint()));
            }
            Ok(())
        }

        async fn restart(&self, old: &ConfigHolder, new: &ConfigHolder) -> Result<(), Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("restart:{}:{}", old.fingerprint(), new.fingerprint()));
            Ok(())
        }

        async fn stop_all(&self) {}
    }

    struct UidBuilder;

    #[async_trait]
    impl PollerBuilder for UidBuilder {
        fn name(&self) -> &'static str {
            "uid_builder"
        }

        async fn build_module_configs(&self, pod: &Pod) -> Vec<ConfigHolder> {
            let mut doc = config::empty();
            config::set(
                &mut doc,
                "uid",
                Value::String(pod::pod_uid(pod).unwrap_or_default().to_string()),
            );
            vec![ConfigHolder::new(doc)]
        }
    }

    struct CountingPush {
        count: Mutex<u64>,
    }

    #[async_trait]
    impl PushBuilder for CountingPush {
        fn name(&self) -> &'static str {
            "counting_push"
        }

        fn add_module_config(&self, _pod: &Pod) -> Option<ConfigHolder> {
            *self.count.lock().unwrap() += 1;
            self.module_config()
        }

        fn remove_module_config(&self, _pod: &Pod) -> Option<ConfigHolder> {
            *self.count.lock().unwrap() -= 1;
            self.module_config()
        }

        fn module_config(&self) -> Option<ConfigHolder> {
            let mut doc = config::empty();
            config::set(
                &mut doc,
                "count",
                Value::Number((*self.count.lock().unwrap()).into()),
            );
            Some(ConfigHolder::new(doc))
        }
    }

    struct MarkerAppender;

    #[async_trait]
    impl Appender for MarkerAppender {
        async fn append(&self, holder: &mut ConfigHolder) {
            config::set(&mut holder.config, "appended", Value::Bool(true));
        }
    }

    fn make_pod(uid: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn expected_fingerprint(yaml: &str) -> u64 {
        let doc: Document = serde_yaml::from_str(yaml).unwrap();
        ConfigHolder::new(doc).fingerprint()
    }

    #[tokio::test]
    async fn test_poller_dispatch_applies_appenders_before_factory() {
        let pipeline = Pipeline::new(
            vec![Builder::Poller(Box::new(UidBuilder))],
            vec![Box::new(MarkerAppender)],
        );
        let factory = Arc::new(RecordingFactory::default());
        pipeline.set_factory(factory.clone());

        let pod = make_pod("u1");
        pipeline.start_module_runners(&pod).await;
        pipeline.stop_module_runners(&pod).await;

        let with_marker = expected_fingerprint("{uid: u1, appended: true}");
        let events = factory.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                format!("start:{}", with_marker),
                format!("stop:{}", with_marker)
            ]
        );
    }

    #[tokio::test]
    async fn test_push_dispatch_restarts_old_and_new() {
        let pipeline = Pipeline::new(
            vec![Builder::Push(Box::new(CountingPush {
                count: Mutex::new(0),
            }))],
            vec![],
        );
        let factory = Arc::new(RecordingFactory::default());
        pipeline.set_factory(factory.clone());

        let pod = make_pod("u1");
        pipeline.start_module_runners(&pod).await;
        pipeline.stop_module_runners(&pod).await;

        let zero = expected_fingerprint("{count: 0}");
        let one = expected_fingerprint("{count: 1}");
        let events = factory.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                format!("restart:{}:{}", zero, one),
                format!("restart:{}:{}", one, zero)
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_without_factory_is_dropped() {
        let pipeline = Pipeline::new(vec![Builder::Poller(Box::new(UidBuilder))], vec![]);
        // No factory attached; must not panic.
        pipeline.start_module_runners(&make_pod("u1")).await;
    }
}
