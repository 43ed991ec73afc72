use async_trait::async_trait;
use collectbeat_shared::config::{self, ConfigHolder, Document};
use log::error;
use serde_yaml::Value;

use crate::appender::Appender;
use crate::error::Error;

pub const AUTH_APPENDER: &str = "auth";

const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AuthConfig {
    namespaces: Vec<String>,
    token_path: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            namespaces: vec![
                "apiserver".to_string(),
                "scheduler".to_string(),
                "controller_manager".to_string(),
            ],
            token_path: DEFAULT_TOKEN_PATH.to_string(),
        }
    }
}

/// Injects the service-account bearer token into prometheus module configs
/// that scrape the cluster's secured control-plane namespaces.
pub struct SecurityAppender {
    namespaces: Vec<String>,
    token_path: String,
}

pub fn new_appender(appender_config: &Document) -> Result<Box<dyn Appender>, Error> {
    let cfg: AuthConfig = config::unpack(appender_config).map_err(|e| {
        Error::Configuration(format!(
            "fail to unpack the `auth` appender configuration: {}",
            e
        ))
    })?;

    Ok(Box::new(SecurityAppender {
        namespaces: cfg.namespaces,
        token_path: cfg.token_path,
    }))
}

#[async_trait]
impl Appender for SecurityAppender {
    async fn append(&self, holder: &mut ConfigHolder) {
        if config::get_str(&holder.config, "module") != Some("prometheus") {
            return;
        }
        let Some(namespace) = config::get_str(&holder.config, "namespace") else {
            return;
        };
        if !self.namespaces.iter().any(|secured| secured == namespace) {
            return;
        }

        let raw = match tokio::fs::read_to_string(&self.token_path).await {
            Ok(raw) => raw,
            Err(e) => {
                error!("append - reading token file failed with err: {}", e);
                return;
            }
        };
        let token = raw.strip_suffix('\n').unwrap_or(&raw);
        if token.is_empty() {
            return;
        }

        let mut headers = config::empty();
        config::set(
            &mut headers,
            "Authorization",
            Value::String(format!("Bearer {}", token)),
        );
        config::set(&mut holder.config, "headers", headers);
    }
}
