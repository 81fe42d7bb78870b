//! Conflux Pipeline: transformer registry and sequential executor.
//!
//! Each step's spec is decoded with its kind's own schema, templated against
//! the current params and run as a cancellable task raced against the
//! deadline captured when the kind was registered.

#![forbid(unsafe_code)]

pub mod error;
pub mod registry;
pub mod transformer;

pub use error::{PipelineError, ValidationErrors};
pub use registry::{Registry, TransformerInfo};
pub use transformer::{PromptFn, StepContext, Transformer, TransformerFactory};
