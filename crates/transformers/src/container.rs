//! `core/v1alpha:container`: hand the accumulated result to a sandboxed task
//! and take its output as the new result.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use conflux_core::{template_struct, JsonMap, Params, Templated};
use conflux_pipeline::{StepContext, Transformer, TransformerFactory};
use conflux_sandbox::{Task, TaskExecutor};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub const CREDITS: u32 = 10;
pub const DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStepSpec {
    #[serde(default)]
    pub image: Templated,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}
template_struct!(ContainerStepSpec { image, cpu, memory });

/// Unique task name; also the result sentinel, so it must be a valid pod name.
pub fn task_name() -> String { format!("conflux-{}", uuid::Uuid::new_v4().simple()) }

pub struct ContainerFactory {
    executor: Option<TaskExecutor>,
}

impl ContainerFactory {
    /// `None` registers the kind without a sandbox; executing it then fails.
    pub fn new(executor: Option<TaskExecutor>) -> Self { Self { executor } }
}

impl TransformerFactory for ContainerFactory {
    type Spec = ContainerStepSpec;

    fn build(&self, spec: Option<ContainerStepSpec>, _params: &Params) -> Result<Box<dyn Transformer>> {
        Ok(Box::new(ContainerStep { spec: spec.unwrap_or_default(), executor: self.executor.clone() }))
    }
}

pub struct ContainerStep {
    spec: ContainerStepSpec,
    executor: Option<TaskExecutor>,
}

#[async_trait::async_trait]
impl Transformer for ContainerStep {
    async fn execute(&self, ctx: &StepContext, base: JsonMap) -> Result<JsonMap> {
        let executor = self.executor.as_ref().ok_or_else(|| anyhow!("no sandbox runtime configured"))?;
        let task = Task {
            image: self.spec.image.as_str().to_string(),
            name: task_name(),
            timeout: ctx.remaining().saturating_sub(Duration::from_secs(1)),
            input: Json::Object(base),
            cpu: self.spec.cpu.clone(),
            memory: self.spec.memory.clone(),
        };
        let out = executor.run_task(&task, &ctx.cancel).await.with_context(|| format!("sandbox task {}", task.name))?;
        debug!(task = %task.name, image = %task.image, "container: task ok");
        match out {
            Json::Object(map) => Ok(map),
            other => Err(anyhow!("task {} returned {}, expected a JSON object", task.name, kind_of(&other))),
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.spec.image.is_empty(), "image is required");
        Ok(())
    }

    fn credits_consumed(&self) -> u32 { CREDITS }

    fn deadline(&self) -> Duration { DEADLINE }
}

fn kind_of(v: &Json) -> &'static str { conflux_core::JsonKind::of(v).as_str() }

pub fn scaffold() -> Json { serde_json::json!({ "image": "ghcr.io/example/render:latest" }) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_pod_names() {
        let (a, b) = (task_name(), task_name());
        assert_ne!(a, b);
        assert!(a.len() <= 63);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }
}
