use thiserror::Error;

/// Failure categories surfaced by the discovery pipeline. Configuration and
/// registration problems abort startup; everything else is logged by the
/// caller and the process keeps going.
#[derive(Debug, Error)]
pub enum Error {
    /// Operator-supplied configuration was rejected.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A plugin name was registered twice, or resolves to nothing.
    #[error("plugin registration: {0}")]
    Registration(String),

    /// The pod watcher did not finish its initial sync within the ready
    /// timeout.
    #[error("pod watcher did not become ready")]
    NotReady,

    /// A factory failed to deploy or tear down a collector.
    #[error("factory: {0}")]
    Factory(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
