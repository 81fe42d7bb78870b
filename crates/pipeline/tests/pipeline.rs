use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conflux_core::{template_struct, BaseTransformer, Gvk, JsonMap, Params, Templated};
use conflux_pipeline::{PipelineError, Registry, StepContext, Transformer, TransformerFactory};
use serde::Deserialize;
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, Default, Deserialize)]
struct SetSpec {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Templated,
}
template_struct!(SetSpec { key, value });

/// Writes `key = value` into the result and records the base it saw.
struct SetFactory {
    seen: Arc<std::sync::Mutex<Vec<JsonMap>>>,
    runs: Arc<AtomicUsize>,
}

struct SetStep {
    spec: SetSpec,
    seen: Arc<std::sync::Mutex<Vec<JsonMap>>>,
    runs: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Transformer for SetStep {
    async fn execute(&self, _ctx: &StepContext, mut base: JsonMap) -> anyhow::Result<JsonMap> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(base.clone());
        base.insert(self.spec.key.clone(), Json::String(self.spec.value.as_str().to_string()));
        Ok(base)
    }
    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.spec.key.is_empty(), "key is required");
        Ok(())
    }
    fn credits_consumed(&self) -> u32 { 2 }
    fn deadline(&self) -> Duration { Duration::from_secs(1) }
}

impl TransformerFactory for SetFactory {
    type Spec = SetSpec;
    fn build(&self, spec: Option<SetSpec>, _params: &Params) -> anyhow::Result<Box<dyn Transformer>> {
        Ok(Box::new(SetStep { spec: spec.unwrap_or_default(), seen: self.seen.clone(), runs: self.runs.clone() }))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NoSpec {}
template_struct!(NoSpec {});

struct SlowFactory;
struct SlowStep;

#[async_trait::async_trait]
impl Transformer for SlowStep {
    async fn execute(&self, ctx: &StepContext, base: JsonMap) -> anyhow::Result<JsonMap> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(5)) => Ok(base),
            _ = ctx.cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }
    fn credits_consumed(&self) -> u32 { 5 }
    fn deadline(&self) -> Duration { Duration::from_millis(50) }
}

impl TransformerFactory for SlowFactory {
    type Spec = NoSpec;
    fn build(&self, _spec: Option<NoSpec>, _params: &Params) -> anyhow::Result<Box<dyn Transformer>> { Ok(Box::new(SlowStep)) }
}

struct BrokenFactory;
impl TransformerFactory for BrokenFactory {
    type Spec = NoSpec;
    fn build(&self, spec: Option<NoSpec>, _params: &Params) -> anyhow::Result<Box<dyn Transformer>> {
        match spec {
            None => anyhow::bail!("needs a spec"),
            Some(_) => Ok(Box::new(SlowStep)),
        }
    }
}

/// Requests `id` be overwritten with a number.
struct RetypeFactory;
struct RetypeStep;

#[async_trait::async_trait]
impl Transformer for RetypeStep {
    async fn execute(&self, _ctx: &StepContext, base: JsonMap) -> anyhow::Result<JsonMap> { Ok(base) }
    fn params(&self) -> Params { Params::new().with("id", 9) }
    fn credits_consumed(&self) -> u32 { 1 }
    fn deadline(&self) -> Duration { Duration::from_secs(1) }
}

impl TransformerFactory for RetypeFactory {
    type Spec = NoSpec;
    fn build(&self, _spec: Option<NoSpec>, _params: &Params) -> anyhow::Result<Box<dyn Transformer>> { Ok(Box::new(RetypeStep)) }
}

struct Fixture {
    registry: Registry,
    seen: Arc<std::sync::Mutex<Vec<JsonMap>>>,
    runs: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let runs = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    registry.register(Gvk::core("set"), SetFactory { seen: seen.clone(), runs: runs.clone() }).expect("set");
    registry.register(Gvk::core("slow"), SlowFactory).expect("slow");
    registry.register(Gvk::core("retype"), RetypeFactory).expect("retype");
    Fixture { registry, seen, runs }
}

fn set(key: &str, value: &str) -> BaseTransformer {
    BaseTransformer::new(Gvk::core("set"), json!({"key": key, "value": value}))
}

#[tokio::test]
async fn empty_pipeline_is_stamped() {
    let f = fixture();
    let out = f.registry.execute(&[], Params::new().with("manifestCID", "bafy1")).await.expect("execute");
    assert_eq!(out.len(), 1);
    assert_eq!(out["manifestInfo"]["transformerCount"], json!(0));
    assert_eq!(out["manifestInfo"]["manifestCID"], json!("bafy1"));
    assert!(out["manifestInfo"]["generatedAt"].is_string());
}

#[tokio::test]
async fn output_of_one_step_is_input_of_the_next() {
    let f = fixture();
    let steps = vec![set("name", "token-{{id}}"), set("copy", "{{result.name}}")];
    let out = f.registry.execute(&steps, Params::new().with("id", "7")).await.expect("execute");

    let seen = f.seen.lock().unwrap();
    assert!(seen[0].is_empty());
    let mut expected = JsonMap::new();
    expected.insert("name".into(), json!("token-7"));
    assert_eq!(seen[1], expected);
    assert_eq!(out["copy"], json!("token-7"));
    assert_eq!(out["manifestInfo"]["transformerCount"], json!(2));
}

#[tokio::test]
async fn persisted_spec_is_not_mutated_by_templating() {
    let f = fixture();
    let steps = vec![set("name", "{{id}}")];
    let before = steps.clone();
    f.registry.execute(&steps, Params::new().with("id", "1")).await.expect("first");
    f.registry.execute(&steps, Params::new().with("id", "2")).await.expect("second");
    assert_eq!(steps, before);
}

#[tokio::test]
async fn timeout_aborts_remaining_steps() {
    let f = fixture();
    let steps = vec![BaseTransformer::new(Gvk::core("slow"), Json::Null), set("after", "x")];
    let err = f.registry.execute(&steps, Params::new()).await.expect_err("timeout");
    match err {
        PipelineError::StepTimeout { gvk, deadline } => {
            assert_eq!(gvk, Gvk::core("slow"));
            assert_eq!(deadline, Duration::from_millis(50));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(f.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_kind_fails_fast() {
    let f = fixture();
    let steps = vec![BaseTransformer::new(Gvk::core("missing"), Json::Null), set("after", "x")];
    let err = f.registry.execute(&steps, Params::new()).await.expect_err("unknown");
    assert!(matches!(err, PipelineError::UnknownTransformer { ref gvk } if *gvk == Gvk::core("missing")));
    assert_eq!(f.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unresolved_placeholder_is_a_templating_error() {
    let f = fixture();
    let err = f.registry.execute(&[set("k", "{{nope}}")], Params::new()).await.expect_err("template");
    assert!(matches!(err, PipelineError::TemplatingFailed { .. }));
    assert_eq!(err.gvk(), Some(&Gvk::core("set")));
}

#[tokio::test]
async fn param_type_conflict_aborts() {
    let f = fixture();
    let steps = vec![BaseTransformer::new(Gvk::core("retype"), Json::Null)];
    let err = f.registry.execute(&steps, Params::new().with("id", "7")).await.expect_err("conflict");
    assert!(matches!(err, PipelineError::ParamTypeConflict { .. }));

    // Absent keys are never introduced.
    f.registry.execute(&steps, Params::new()).await.expect("no id, no conflict");
}

#[test]
fn credits_sum_or_zero() {
    let f = fixture();
    let steps = vec![set("a", "1"), BaseTransformer::new(Gvk::core("slow"), Json::Null)];
    assert_eq!(f.registry.calculate_credits(&steps), 7);

    let mut partial = steps.clone();
    partial.push(BaseTransformer::new(Gvk::core("ghost"), Json::Null));
    assert_eq!(f.registry.calculate_credits(&partial), 0);
    assert_eq!(f.registry.calculate_credits(&[]), 0);
}

#[test]
fn duplicate_and_probe_failures() {
    let mut f = fixture();
    let dup = f.registry.register(Gvk::core("slow"), SlowFactory).expect_err("dup");
    assert!(matches!(dup, PipelineError::DuplicateRegistration { .. }));

    let probe = f.registry.register(Gvk::core("broken"), BrokenFactory).expect_err("probe");
    assert!(matches!(probe, PipelineError::RegistrationProbeFailed { .. }));
    assert!(!f.registry.contains(&Gvk::core("broken")));
}

#[test]
fn validate_aggregates_both_classes() {
    let f = fixture();
    let steps = vec![
        set("ok", "v"),
        BaseTransformer::new(Gvk::core("set"), json!({"value": "no key"})),
        BaseTransformer::new(Gvk::core("ghost"), Json::Null),
        BaseTransformer::new(Gvk::new("other", "v1", "thing"), Json::Null),
    ];
    match f.registry.validate(&steps).expect_err("invalid") {
        PipelineError::Validation(errs) => {
            assert_eq!(errs.unregistered, vec!["core/v1alpha:ghost".to_string(), "other/v1:thing".to_string()]);
            assert_eq!(errs.invalid.len(), 1);
            assert!(errs.invalid[0].contains("key is required"));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(f.registry.validate(&[set("ok", "{{unresolved}}")]).is_ok());
}
