//! `core/v1alpha:local`: read a JSON object from the local filesystem and merge it over the base.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use conflux_core::{template_struct, JsonMap, Params, Templated};
use conflux_pipeline::{StepContext, Transformer, TransformerFactory};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const CREDITS: u32 = 1;
pub const DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalSpec {
    #[serde(default)]
    pub path: Templated,
}
template_struct!(LocalSpec { path });

pub struct LocalFactory;

impl TransformerFactory for LocalFactory {
    type Spec = LocalSpec;

    fn build(&self, spec: Option<LocalSpec>, _params: &Params) -> Result<Box<dyn Transformer>> {
        Ok(Box::new(LocalStep { spec: spec.unwrap_or_default() }))
    }
}

pub struct LocalStep {
    spec: LocalSpec,
}

#[async_trait::async_trait]
impl Transformer for LocalStep {
    async fn execute(&self, _ctx: &StepContext, mut base: JsonMap) -> Result<JsonMap> {
        let path = self.spec.path.as_str();
        let data = tokio::fs::read(path).await.with_context(|| format!("reading {path}"))?;
        let loaded: JsonMap = serde_json::from_slice(&data).with_context(|| format!("{path} is not a JSON object"))?;
        base.extend(loaded);
        Ok(base)
    }

    fn validate(&self) -> Result<()> {
        let path = self.spec.path.as_str();
        anyhow::ensure!(!path.is_empty(), "path is required");
        if !path.contains("{{") {
            anyhow::ensure!(Path::new(path).exists(), "{path} does not exist");
        }
        Ok(())
    }

    fn credits_consumed(&self) -> u32 { CREDITS }

    fn deadline(&self) -> Duration { DEADLINE }
}

pub fn scaffold() -> Json { serde_json::json!({ "path": "./metadata/{{id}}.json" }) }
