//! Conflux hooks: post-generation side effects resolved by type and run off
//! the request path by a bounded dispatcher.

#![forbid(unsafe_code)]

pub mod api;
pub mod dispatch;
pub mod error;
pub mod hook;

pub use api::{ApiHook, ApiHookFactory, ApiHookSpec};
pub use dispatch::{HookDispatcher, HookJob, HookOutcome};
pub use error::HookError;
pub use hook::{decode_templated, Hook, HookFactory, HookRegistry};

/// Registry with the built-in `api` hook.
pub fn default_registry() -> anyhow::Result<HookRegistry> {
    let mut r = HookRegistry::new();
    r.register(api::KIND, ApiHookFactory::new()?)?;
    Ok(r)
}
