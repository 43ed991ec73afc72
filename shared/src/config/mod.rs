mod fingerprint;

pub use fingerprint::fingerprint;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

/// The structured document every collector configuration flows through.
///
/// Builders emit it, appenders mutate it, factories fingerprint and
/// materialize it. YAML values cover everything the collector runtimes
/// accept, so no second representation is needed.
pub type Document = Value;

/// Sideband metadata carried next to a config document: container id to the
/// log paths the pod declared for it. Consumed by the log-path appender.
pub type Meta = HashMap<String, Vec<String>>;

/// A draft collector configuration on its way from a builder to a factory.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigHolder {
    pub config: Document,
    pub meta: Meta,
}

impl ConfigHolder {
    pub fn new(config: Document) -> Self {
        ConfigHolder {
            config,
            meta: Meta::new(),
        }
    }

    pub fn with_meta(config: Document, meta: Meta) -> Self {
        ConfigHolder { config, meta }
    }

    /// Canonical 64-bit hash of the document. The reconciliation key.
    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.config)
    }

    /// True when there is nothing to deploy for this holder.
    pub fn is_empty(&self) -> bool {
        match &self.config {
            Value::Null => true,
            Value::Sequence(items) => items.is_empty(),
            Value::Mapping(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// An `enabled` toggle, the way several config sections spell it.
#[derive(Debug, Clone, Deserialize)]
pub struct Enabled {
    pub enabled: bool,
}

impl Enabled {
    pub fn new(enabled: bool) -> Self {
        Enabled { enabled }
    }
}

/// Serialize any value into a document.
pub fn pack<T: Serialize>(value: &T) -> anyhow::Result<Document> {
    Ok(serde_yaml::to_value(value)?)
}

/// Deserialize a document into a concrete config type.
pub fn unpack<T: DeserializeOwned>(doc: &Document) -> anyhow::Result<T> {
    Ok(serde_yaml::from_value(doc.clone())?)
}

/// An empty mapping document.
pub fn empty() -> Document {
    Value::Mapping(Mapping::new())
}

/// Fetch a top-level field from a mapping document.
pub fn get<'a>(doc: &'a Document, key: &str) -> Option<&'a Document> {
    doc.as_mapping()?.get(&Value::String(key.to_string()))
}

pub fn get_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    get(doc, key)?.as_str()
}

/// Set a top-level field on a mapping document. Null documents become a
/// mapping; documents of any other shape are left alone.
pub fn set(doc: &mut Document, key: &str, value: Document) {
    if doc.is_null() {
        *doc = empty();
    }
    if let Some(map) = doc.as_mapping_mut() {
        map.insert(Value::String(key.to_string()), value);
    }
}

/// Deep-merge `overlay` into `base`. Mappings merge recursively; any other
/// overlay value replaces the base value.
pub fn merge(base: &mut Document, overlay: &Document) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map.iter() {
                match base_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
