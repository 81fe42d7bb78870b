use std::fmt;
use std::time::Duration;

use conflux_core::{Gvk, ParamConflict, TemplateError};

/// Aggregated result of [`crate::Registry::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub unregistered: Vec<String>,
    pub invalid: Vec<String>,
}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool { self.unregistered.is_empty() && self.invalid.is_empty() }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.unregistered.is_empty() {
            write!(f, "transformers {} not registered", self.unregistered.join(", "))?;
            if !self.invalid.is_empty() { f.write_str("; ")?; }
        }
        if !self.invalid.is_empty() {
            write!(f, "validation failed: {}", self.invalid.join(", "))?;
        }
        Ok(())
    }
}

/// Pipeline errors. Every step-level variant carries the originating GVK.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("transformer {gvk} unknown")]
    UnknownTransformer { gvk: Gvk },
    #[error("transformer {gvk} already registered")]
    DuplicateRegistration { gvk: Gvk },
    #[error("failed to initialize empty transformer {gvk}: {source:#}")]
    RegistrationProbeFailed { gvk: Gvk, source: anyhow::Error },
    #[error("{gvk}: invalid spec: {source}")]
    InvalidSpec { gvk: Gvk, source: serde_json::Error },
    #[error("{gvk}: templating failed: {source}")]
    TemplatingFailed { gvk: Gvk, source: TemplateError },
    #[error("{gvk}: transformer exceeded deadline of {deadline:?}")]
    StepTimeout { gvk: Gvk, deadline: Duration },
    #[error("{gvk}: {source:#}")]
    StepFailed { gvk: Gvk, source: anyhow::Error },
    #[error("{gvk}: {source}")]
    ParamTypeConflict { gvk: Gvk, source: ParamConflict },
    #[error("{0}")]
    Validation(ValidationErrors),
}

impl PipelineError {
    /// GVK of the step or registration that produced the error, if any.
    pub fn gvk(&self) -> Option<&Gvk> {
        match self {
            Self::UnknownTransformer { gvk }
            | Self::DuplicateRegistration { gvk }
            | Self::RegistrationProbeFailed { gvk, .. }
            | Self::InvalidSpec { gvk, .. }
            | Self::TemplatingFailed { gvk, .. }
            | Self::StepTimeout { gvk, .. }
            | Self::StepFailed { gvk, .. }
            | Self::ParamTypeConflict { gvk, .. } => Some(gvk),
            Self::Validation(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool { matches!(self, Self::StepTimeout { .. }) }
}
