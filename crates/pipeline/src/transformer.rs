//! Transformer trait, typed factories and their type-erased registry form.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use conflux_core::{Gvk, JsonMap, Params, Status, Template};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

/// Per-step execution context: the step's GVK, its deadline and a token
/// cancelled when the deadline fires.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub gvk: Gvk,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(gvk: Gvk, budget: Duration) -> Self {
        Self { gvk, deadline: Instant::now() + budget, cancel: CancellationToken::new() }
    }

    /// Time left before the step deadline (zero once passed).
    pub fn remaining(&self) -> Duration { self.deadline.saturating_duration_since(Instant::now()) }
}

/// A pipeline step. Consumes the accumulated result and produces the next one.
#[async_trait::async_trait]
pub trait Transformer: Send + Sync {
    async fn execute(&self, ctx: &StepContext, base: JsonMap) -> anyhow::Result<JsonMap>;

    /// Semantic validation of the (untemplated) spec.
    fn validate(&self) -> anyhow::Result<()> { Ok(()) }

    fn status(&self) -> Vec<Status> { Vec::new() }

    /// Keys the step requests to overwrite in the shared params.
    fn params(&self) -> Params { Params::new() }

    fn credits_consumed(&self) -> u32;

    fn deadline(&self) -> Duration;
}

/// Builds transformers of one kind from a typed spec.
///
/// `spec` is `None` only for the registration probe, which reads the
/// intrinsic credits and deadline of the kind.
pub trait TransformerFactory: Send + Sync + 'static {
    type Spec: DeserializeOwned + Template + Send + 'static;

    fn build(&self, spec: Option<Self::Spec>, params: &Params) -> anyhow::Result<Box<dyn Transformer>>;
}

/// Interactive spec builder attached to a registry entry.
pub type PromptFn = Arc<dyn Fn() -> anyhow::Result<conflux_core::BaseTransformer> + Send + Sync>;

/// Object-safe view of a [`TransformerFactory`]: decodes the raw spec with
/// the kind's own schema before building.
pub(crate) trait ErasedFactory: Send + Sync {
    fn probe(&self) -> anyhow::Result<Box<dyn Transformer>>;
    fn instantiate(&self, gvk: &Gvk, spec: &Json, params: &Params, templated: bool) -> Result<Box<dyn Transformer>, PipelineError>;
}

pub(crate) struct Typed<F: TransformerFactory> {
    factory: F,
    _spec: PhantomData<fn() -> F::Spec>,
}

impl<F: TransformerFactory> Typed<F> {
    pub(crate) fn new(factory: F) -> Self { Self { factory, _spec: PhantomData } }
}

impl<F: TransformerFactory> ErasedFactory for Typed<F> {
    fn probe(&self) -> anyhow::Result<Box<dyn Transformer>> { self.factory.build(None, &Params::new()) }

    fn instantiate(&self, gvk: &Gvk, spec: &Json, params: &Params, templated: bool) -> Result<Box<dyn Transformer>, PipelineError> {
        // An absent spec decodes as an empty object so all-default specs need no payload.
        let raw = if spec.is_null() { Json::Object(JsonMap::new()) } else { spec.clone() };
        let decoded: F::Spec = serde_json::from_value(raw)
            .map_err(|source| PipelineError::InvalidSpec { gvk: gvk.clone(), source })?;
        let decoded = if templated {
            decoded.template(params).map_err(|source| PipelineError::TemplatingFailed { gvk: gvk.clone(), source })?
        } else {
            decoded
        };
        self.factory
            .build(Some(decoded), params)
            .map_err(|source| PipelineError::StepFailed { gvk: gvk.clone(), source })
    }
}
