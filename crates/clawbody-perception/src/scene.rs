//! Scene-understanding seam.

use async_trait::async_trait;
use clawbody_types::BodyError;

/// Turns a JPEG snapshot into a short natural-language description.
#[async_trait]
pub trait SceneDescriber: Send + Sync {
    async fn describe(&self, jpeg: Vec<u8>) -> Result<String, BodyError>;
}
