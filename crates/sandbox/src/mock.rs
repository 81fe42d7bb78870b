//! In-memory container runtime for tests. Records every lifecycle call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::StreamExt;
use rustc_hash::FxHashMap;

use crate::runtime::{ContainerRuntime, ContainerSpec, LogStreams};

/// What a mock container "prints" and how it exits.
#[derive(Debug, Clone, Default)]
pub struct MockRun {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    /// How long `wait` blocks before the container stops.
    pub runtime: Duration,
}

type Program = Arc<dyn Fn(&ContainerSpec) -> MockRun + Send + Sync>;

pub struct MockRuntime {
    program: Program,
    pub image_present: bool,
    pub fail_kill: bool,
    pub fail_logs: bool,
    calls: Mutex<Vec<String>>,
    specs: Mutex<FxHashMap<String, ContainerSpec>>,
}

impl MockRuntime {
    /// `program` computes the container's output from its spec (env included).
    pub fn new(program: impl Fn(&ContainerSpec) -> MockRun + Send + Sync + 'static) -> Self {
        Self {
            program: Arc::new(program),
            image_present: true,
            fail_kill: false,
            fail_logs: false,
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(FxHashMap::default()),
        }
    }

    /// Container that always produces `run`.
    pub fn fixed(run: MockRun) -> Self { Self::new(move |_| run.clone()) }

    pub fn calls(&self) -> Vec<String> { self.calls.lock().map(|c| c.clone()).unwrap_or_default() }

    pub fn count(&self, op: &str) -> usize { self.calls().iter().filter(|c| c.as_str() == op).count() }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> { self.specs.lock().ok().and_then(|s| s.get(id).cloned()) }

    fn record(&self, op: &str) {
        if let Ok(mut c) = self.calls.lock() { c.push(op.to_string()); }
    }

    fn run_for(&self, id: &str) -> Result<MockRun> {
        let spec = self.spec(id).ok_or_else(|| anyhow!("no such container {id}"))?;
        Ok((self.program)(&spec))
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_present(&self, _image: &str) -> Result<bool> {
        self.record("image_present");
        Ok(self.image_present)
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        self.record("pull");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create");
        let id = format!("mock-{}", spec.name);
        self.specs.lock().map_err(|_| anyhow!("poisoned"))?.insert(id.clone(), spec.clone());
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        self.record("wait");
        let run = self.run_for(id)?;
        tokio::time::sleep(run.runtime).await;
        Ok(run.exit_code)
    }

    async fn logs(&self, id: &str) -> Result<LogStreams> {
        self.record("logs");
        if self.fail_logs { anyhow::bail!("log stream unavailable"); }
        let run = self.run_for(id)?;
        let out = futures::stream::iter(vec![Ok(Bytes::from(run.stdout))]).boxed();
        let err = futures::stream::iter(vec![Ok(Bytes::from(run.stderr))]).boxed();
        Ok(LogStreams { stdout: out, stderr: err })
    }

    async fn kill(&self, _id: &str) -> Result<()> {
        self.record("kill");
        if self.fail_kill { anyhow::bail!("kill refused"); }
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        self.record("remove");
        Ok(())
    }
}
