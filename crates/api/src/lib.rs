//! Conflux public API facade (in-process).
//!
//! Frontends (CLI, an HTTP layer) depend on [`ConfluxApi`]. [`Service`] is
//! the in-process implementation over a registry, a resolver and a cache.

#![forbid(unsafe_code)]

use conflux_core::Manifest;
use conflux_pipeline::PipelineError;
use serde_json::Value as Json;

mod service;

pub use service::Service;

/// API errors, distinguishable by kind so a transport can map them to status codes.
#[derive(Debug, thiserror::Error)]
pub enum ConfluxError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("invalid_version: {0}")]
    InvalidVersion(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("alias_conflict: {0}")]
    AliasConflict(String),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("internal: {0}")]
    Internal(String),
}

impl ConfluxError {
    /// HTTP status an HTTP layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            ConfluxError::NotFound(_) => 404,
            ConfluxError::InvalidVersion(_) | ConfluxError::Validation(_) => 400,
            ConfluxError::AlreadyExists(_) | ConfluxError::AliasConflict(_) => 409,
            ConfluxError::Unauthorized(_) => 403,
            ConfluxError::Pipeline(e) if e.is_timeout() => 504,
            ConfluxError::Pipeline(PipelineError::Validation(_)) => 400,
            ConfluxError::Pipeline(_) => 502,
            ConfluxError::Internal(_) => 500,
        }
    }
}

impl From<anyhow::Error> for ConfluxError {
    fn from(e: anyhow::Error) -> Self { ConfluxError::Internal(format!("{e:#}")) }
}

pub type ConfluxResult<T> = Result<T, ConfluxError>;

/// Declarative Conflux API surface.
#[async_trait::async_trait]
pub trait ConfluxApi: Send + Sync {
    /// Store a new manifest owned by `owner`; returns its content id.
    async fn create_manifest(&self, manifest: Manifest, owner: &str) -> ConfluxResult<String>;

    /// Replace the manifest at `chain_id/contract` with a new version; returns its content id.
    async fn update_manifest(&self, chain_id: u64, contract: &str, manifest: Manifest, owner: &str) -> ConfluxResult<String>;

    async fn get_manifest(&self, chain_id: u64, contract: &str, owner: &str) -> ConfluxResult<Manifest>;

    /// Force regeneration of one token regardless of cache state.
    async fn refresh(&self, chain_id: u64, contract: &str, token_id: &str, owner: &str) -> ConfluxResult<Json>;

    /// Token metadata through the composite read policy.
    async fn get_metadata(&self, chain_id: u64, contract: &str, token_id: &str) -> ConfluxResult<Json>;

    /// Same as [`ConfluxApi::get_metadata`], addressing the manifest by alias.
    async fn get_metadata_by_alias(&self, alias: &str, token_id: &str) -> ConfluxResult<Json>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::Gvk;

    #[test]
    fn kinds_map_to_distinct_statuses() {
        assert_eq!(ConfluxError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ConfluxError::AliasConflict("x".into()).status_code(), 409);
        assert_eq!(ConfluxError::Unauthorized("x".into()).status_code(), 403);
        let timeout = PipelineError::StepTimeout { gvk: Gvk::core("x"), deadline: std::time::Duration::from_secs(1) };
        assert_eq!(ConfluxError::from(timeout).status_code(), 504);
        assert_eq!(ConfluxError::from(anyhow::anyhow!("boom")).status_code(), 500);
    }
}
