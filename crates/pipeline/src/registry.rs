//! Transformer registry and the sequential pipeline executor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conflux_core::params::{PARAM_MANIFEST_CID, PARAM_RESULT};
use conflux_core::{BaseTransformer, Gvk, JsonMap, ManifestInfo, Params};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, ValidationErrors};
use crate::transformer::{ErasedFactory, PromptFn, StepContext, Transformer, TransformerFactory, Typed};

/// Registry entry: the kind's factory plus the intrinsic cost and deadline
/// captured by the registration probe.
#[derive(Clone)]
pub struct TransformerInfo {
    factory: Arc<dyn ErasedFactory>,
    pub credits: u32,
    pub deadline: Duration,
    pub prompt: Option<PromptFn>,
}

impl std::fmt::Debug for TransformerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerInfo")
            .field("credits", &self.credits)
            .field("deadline", &self.deadline)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

/// Explicit registry value, built at startup and shared by reference.
#[derive(Default, Clone)]
pub struct Registry {
    entries: FxHashMap<Gvk, TransformerInfo>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }

    pub fn register<F: TransformerFactory>(&mut self, gvk: Gvk, factory: F) -> Result<(), PipelineError> {
        self.insert(gvk, Arc::new(Typed::new(factory)), None)
    }

    pub fn register_with_prompt<F: TransformerFactory>(&mut self, gvk: Gvk, factory: F, prompt: PromptFn) -> Result<(), PipelineError> {
        self.insert(gvk, Arc::new(Typed::new(factory)), Some(prompt))
    }

    fn insert(&mut self, gvk: Gvk, factory: Arc<dyn ErasedFactory>, prompt: Option<PromptFn>) -> Result<(), PipelineError> {
        if self.entries.contains_key(&gvk) {
            return Err(PipelineError::DuplicateRegistration { gvk });
        }
        let probe = match factory.probe() {
            Ok(t) => t,
            Err(source) => return Err(PipelineError::RegistrationProbeFailed { gvk, source }),
        };
        let info = TransformerInfo { factory, credits: probe.credits_consumed(), deadline: probe.deadline(), prompt };
        debug!(gvk = %gvk, credits = info.credits, deadline_ms = info.deadline.as_millis() as u64, "registry: registered");
        self.entries.insert(gvk, info);
        Ok(())
    }

    pub fn get(&self, gvk: &Gvk) -> Option<&TransformerInfo> { self.entries.get(gvk) }

    pub fn contains(&self, gvk: &Gvk) -> bool { self.entries.contains_key(gvk) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Registered GVKs in display order.
    pub fn registered(&self) -> Vec<Gvk> {
        let mut v: Vec<Gvk> = self.entries.keys().cloned().collect();
        v.sort_by_key(|g| g.to_string());
        v
    }

    /// Sum of registered credit costs. Any unregistered GVK makes the whole
    /// sum 0; use [`Registry::try_calculate_credits`] to enforce cost.
    pub fn calculate_credits(&self, steps: &[BaseTransformer]) -> u64 {
        self.try_calculate_credits(steps).unwrap_or(0)
    }

    pub fn try_calculate_credits(&self, steps: &[BaseTransformer]) -> Result<u64, PipelineError> {
        steps.iter().try_fold(0u64, |acc, step| {
            let info = self.entries.get(&step.gvk).ok_or_else(|| PipelineError::UnknownTransformer { gvk: step.gvk.clone() })?;
            Ok(acc + u64::from(info.credits))
        })
    }

    /// Resolve every step and run its own validation, aggregating failures
    /// into unregistered and invalid lists.
    pub fn validate(&self, steps: &[BaseTransformer]) -> Result<(), PipelineError> {
        let mut errs = ValidationErrors::default();
        for step in steps {
            let Some(info) = self.entries.get(&step.gvk) else {
                errs.unregistered.push(step.gvk.to_string());
                continue;
            };
            match info.factory.instantiate(&step.gvk, &step.spec, &Params::new(), false) {
                Err(e) => errs.invalid.push(format!("failed to instantiate {}: {e}", step.gvk)),
                Ok(t) => {
                    if let Err(e) = t.validate() {
                        errs.invalid.push(format!("failed to validate {}: {e:#}", step.gvk));
                    }
                }
            }
        }
        if errs.is_empty() { Ok(()) } else { Err(PipelineError::Validation(errs)) }
    }

    /// Instantiate one step with templating applied against `params`.
    pub fn instantiate(&self, step: &BaseTransformer, params: &Params) -> Result<Box<dyn Transformer>, PipelineError> {
        let info = self.entries.get(&step.gvk).ok_or_else(|| PipelineError::UnknownTransformer { gvk: step.gvk.clone() })?;
        info.factory.instantiate(&step.gvk, &step.spec, params, true)
    }

    /// Run `steps` strictly in order, threading the accumulated result and
    /// params. Aborts on the first error; no partial result is returned.
    pub async fn execute(&self, steps: &[BaseTransformer], mut params: Params) -> Result<JsonMap, PipelineError> {
        let started = Instant::now();
        let mut result = JsonMap::new();
        for step in steps {
            let gvk = &step.gvk;
            let info = self.entries.get(gvk).ok_or_else(|| PipelineError::UnknownTransformer { gvk: gvk.clone() })?;
            let transformer: Arc<dyn Transformer> = Arc::from(info.factory.instantiate(gvk, &step.spec, &params, true)?);
            result = run_step(gvk, info.deadline, Arc::clone(&transformer), result).await?;

            params.insert(PARAM_RESULT, Json::Object(result.clone()));
            params
                .apply_updates(&transformer.params())
                .map_err(|source| PipelineError::ParamTypeConflict { gvk: gvk.clone(), source })?;
            for s in transformer.status() {
                debug!(gvk = %gvk, name = %s.name, value = %s.value, "pipeline: step status");
            }
        }

        let info = ManifestInfo {
            generated_at: chrono::Utc::now(),
            transformer_count: steps.len(),
            runtime: started.elapsed().as_millis() as u64,
            manifest_cid: params.get_str(PARAM_MANIFEST_CID).unwrap_or_default().to_string(),
        };
        let stamped = serde_json::to_value(&info).unwrap_or(Json::Null);
        result.insert("manifestInfo".into(), stamped);
        histogram!("pipeline_run_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(steps = steps.len(), took_ms = %started.elapsed().as_millis(), "pipeline: execute ok");
        Ok(result)
    }
}

/// Run one step as an independent task raced against its deadline. On
/// timeout the step's token is cancelled and the task aborted.
async fn run_step(gvk: &Gvk, deadline: Duration, transformer: Arc<dyn Transformer>, base: JsonMap) -> Result<JsonMap, PipelineError> {
    let ctx = StepContext::new(gvk.clone(), deadline);
    let cancel = ctx.cancel.clone();
    let t0 = Instant::now();
    let mut handle = tokio::spawn(async move { transformer.execute(&ctx, base).await });
    let out = match tokio::time::timeout(deadline, &mut handle).await {
        Err(_) => {
            cancel.cancel();
            handle.abort();
            counter!("pipeline_step_timeouts_total", 1u64);
            warn!(gvk = %gvk, deadline_ms = deadline.as_millis() as u64, "pipeline: step timed out");
            return Err(PipelineError::StepTimeout { gvk: gvk.clone(), deadline });
        }
        Ok(Err(join)) => Err(anyhow::anyhow!("step task failed: {join}")),
        Ok(Ok(res)) => res,
    };
    histogram!("pipeline_step_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match out {
        Ok(next) => {
            debug!(gvk = %gvk, took_ms = %t0.elapsed().as_millis(), "pipeline: step ok");
            Ok(next)
        }
        Err(source) => {
            counter!("pipeline_step_failures_total", 1u64);
            warn!(gvk = %gvk, error = %source, "pipeline: step failed");
            Err(PipelineError::StepFailed { gvk: gvk.clone(), source })
        }
    }
}
