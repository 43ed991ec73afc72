use async_trait::async_trait;
use collectbeat_shared::config::{ConfigHolder, Document};

use crate::error::Error;

/// A post-processing pass over every draft config the builders produce.
/// Appenders run in registration order and mutate the holder in place.
#[async_trait]
pub trait Appender: Send + Sync {
    async fn append(&self, holder: &mut ConfigHolder);
}

pub type AppenderConstructor = fn(&Document) -> Result<Box<dyn Appender>, Error>;
