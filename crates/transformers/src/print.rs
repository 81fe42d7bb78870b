//! `core/v1alpha:print`: logs two templated fields and passes the base through.

use std::time::Duration;

use anyhow::Result;
use conflux_core::{template_struct, JsonMap, Params, Status, Templated};
use conflux_pipeline::{StepContext, Transformer, TransformerFactory};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

pub const CREDITS: u32 = 1;
pub const DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintSpec {
    #[serde(default)]
    pub something: Templated,
    #[serde(default)]
    pub something_else: Templated,
}
template_struct!(PrintSpec { something, something_else });

pub struct PrintFactory;

impl TransformerFactory for PrintFactory {
    type Spec = PrintSpec;

    fn build(&self, spec: Option<PrintSpec>, _params: &Params) -> Result<Box<dyn Transformer>> {
        Ok(Box::new(PrintStep { spec: spec.unwrap_or_default() }))
    }
}

pub struct PrintStep {
    spec: PrintSpec,
}

#[async_trait::async_trait]
impl Transformer for PrintStep {
    async fn execute(&self, _ctx: &StepContext, base: JsonMap) -> Result<JsonMap> {
        info!(something = %self.spec.something, something_else = %self.spec.something_else, keys = base.len(), "print");
        Ok(base)
    }

    fn status(&self) -> Vec<Status> {
        vec![Status { name: "printed".into(), value: Json::from(self.spec.something.as_str()) }]
    }

    fn credits_consumed(&self) -> u32 { CREDITS }

    fn deadline(&self) -> Duration { DEADLINE }
}

pub fn scaffold() -> Json { serde_json::json!({ "something": "{{id}}", "somethingElse": "{{contract}}" }) }
