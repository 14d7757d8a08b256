//! Task-definition provider seam.

use async_trait::async_trait;
use thiserror::Error;

use crate::definition::Definition;
use crate::label::LabelError;

/// Failures while resolving a task definition for an image reference.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("image not found: {0}")]
    NotFound(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid or missing task labels: {0}")]
    Labels(#[from] LabelError),
}

/// Source of task definitions. The OCI registry is the production
/// implementation; tests substitute fixed maps.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn fetch_definition(&self, image_ref: &str) -> Result<Definition, ProviderError>;
}
