//! Hook trait and the type-keyed hook registry.

use std::sync::Arc;

use conflux_core::{Params, Template};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tracing::debug;

use crate::error::HookError;

/// A post-generation side effect, already templated against the run's params.
#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    async fn execute(&self) -> anyhow::Result<()>;
}

/// Builds a hook of one type from its raw manifest spec.
pub trait HookFactory: Send + Sync {
    fn build(&self, kind: &str, spec: &Json, params: &Params) -> Result<Box<dyn Hook>, HookError>;
}

/// Decode `spec` into `S` and template it against `params`. A null spec decodes as `{}`.
pub fn decode_templated<S: DeserializeOwned + Template>(kind: &str, spec: &Json, params: &Params) -> Result<S, HookError> {
    let raw = if spec.is_null() { Json::Object(Default::default()) } else { spec.clone() };
    let decoded: S = serde_json::from_value(raw).map_err(|source| HookError::InvalidSpec { kind: kind.to_string(), source })?;
    decoded.template(params).map_err(|source| HookError::TemplatingFailed { kind: kind.to_string(), source })
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    factories: FxHashMap<String, Arc<dyn HookFactory>>,
}

impl HookRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, kind: impl Into<String>, factory: impl HookFactory + 'static) -> Result<(), HookError> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(HookError::DuplicateRegistration { kind });
        }
        debug!(kind = %kind, "hooks: registered");
        self.factories.insert(kind, Arc::new(factory));
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn HookFactory>, HookError> {
        self.factories.get(kind).cloned().ok_or_else(|| HookError::UnknownHook { kind: kind.to_string() })
    }

    pub fn build(&self, hook: &conflux_core::Hook, params: &Params) -> Result<Box<dyn Hook>, HookError> {
        self.get(&hook.kind)?.build(&hook.kind, &hook.spec, params)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut v: Vec<String> = self.factories.keys().cloned().collect();
        v.sort();
        v
    }
}
