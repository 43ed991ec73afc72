pub mod graphite_annotations;
pub mod log_annotations;
pub mod metrics_annotations;
pub mod metrics_secret;
