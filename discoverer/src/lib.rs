#[macro_use]
extern crate serde_derive;

pub mod appender;
pub mod appenders;
pub mod builder;
pub mod builders;
pub mod error;
pub mod factory;
pub mod kubernetes;
pub mod pipeline;
pub mod registry;
pub mod stopper;

pub use error::Error;

use collectbeat_shared::config::{self, Document};
use kubernetes::KubernetesDiscoverer;
use log::{info, warn};
use registry::Register;
use std::collections::HashMap;

/// Instantiate every configured discoverer from the `discovery` config
/// section. Only the `kubernetes` discoverer exists today; unknown names are
/// logged and skipped, disabled entries are ignored.
pub async fn init_discoverers(
    configs: &HashMap<String, Document>,
    registry: &Register,
) -> Result<Vec<KubernetesDiscoverer>, Error> {
    let mut discoverers = Vec::new();
    for (name, discoverer_config) in configs {
        if let Some(false) = config::get(discoverer_config, "enabled").and_then(Document::as_bool)
        {
            continue;
        }
        match name.as_str() {
            kubernetes::KUBERNETES_DISCOVERER => {
                let discoverer = KubernetesDiscoverer::new(discoverer_config, registry).await?;
                info!("activated {} as discovery plugin", name);
                discoverers.push(discoverer);
            }
            other => warn!("unknown discovery plugin {}", other),
        }
    }
    Ok(discoverers)
}
