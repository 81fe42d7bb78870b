//! Built-in `core/v1alpha:*` transformers and their registration.

#![forbid(unsafe_code)]

use std::sync::Arc;

use conflux_core::{BaseTransformer, Gvk};
use conflux_pipeline::{PipelineError, PromptFn, Registry};
use conflux_sandbox::TaskExecutor;
use conflux_store::ContentStore;
use serde_json::Value as Json;

pub mod container;
pub mod contract;
pub mod ipfs;
pub mod local;
pub mod print;

pub use container::{ContainerFactory, ContainerStepSpec};
pub use contract::{AbiValue, ChainClient, ContractFactory, ContractSpec, NoChainClient};
pub use ipfs::{IpfsFactory, IpfsHttpStore, IpfsSpec};
pub use local::{LocalFactory, LocalSpec};
pub use print::{PrintFactory, PrintSpec};

/// Collaborators the built-ins close over.
#[derive(Clone)]
pub struct Builtins {
    pub content: Arc<dyn ContentStore>,
    pub chain: Arc<dyn ChainClient>,
    pub sandbox: Option<TaskExecutor>,
}

fn prompt(gvk: Gvk, scaffold: fn() -> Json) -> PromptFn {
    Arc::new(move || Ok(BaseTransformer::new(gvk.clone(), scaffold())))
}

/// Register every built-in kind under `core/v1alpha`.
pub fn register_builtins(registry: &mut Registry, deps: Builtins) -> Result<(), PipelineError> {
    let Builtins { content, chain, sandbox } = deps;
    let g = Gvk::core;
    registry.register_with_prompt(g("ipfs"), IpfsFactory::new(content), prompt(g("ipfs"), ipfs::scaffold))?;
    registry.register_with_prompt(g("contract"), ContractFactory::new(chain), prompt(g("contract"), contract::scaffold))?;
    registry.register_with_prompt(g("local"), LocalFactory, prompt(g("local"), local::scaffold))?;
    registry.register_with_prompt(g("print"), PrintFactory, prompt(g("print"), print::scaffold))?;
    registry.register_with_prompt(g("container"), ContainerFactory::new(sandbox), prompt(g("container"), container::scaffold))?;
    Ok(())
}
