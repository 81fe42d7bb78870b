//! Task lifecycle: ensure image, create, start, wait, collect logs, clean up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CleanupError, SandboxError, Stage};
use crate::pump::{drain_lines, pump_bytes_to_lines, LogChunk};
use crate::result::extract_result;
use crate::runtime::{ContainerRuntime, ContainerSpec, LogStreams};

/// Env var carrying the task's unique name.
pub const ENV_NAME: &str = "SYNTH_NAME";
/// Env var carrying base64-encoded JSON input.
pub const ENV_DATA: &str = "DATA";

/// One ephemeral sandbox run.
#[derive(Debug, Clone)]
pub struct Task {
    pub image: String,
    /// Unique per invocation; doubles as the result sentinel.
    pub name: String,
    pub timeout: Duration,
    pub input: Json,
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

/// Cancellation token plus absolute deadline shared by every stage of a task.
#[derive(Debug, Clone)]
pub struct TaskScope {
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

impl TaskScope {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        Self { cancel: parent.child_token(), deadline: Instant::now() + timeout }
    }

    /// Resolves once cancelled or past the deadline.
    pub async fn done(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.deadline) => {}
        }
    }

    pub fn remaining(&self) -> Duration { self.deadline.saturating_duration_since(Instant::now()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl TaskLogs {
    /// Stdout followed by stderr.
    pub fn combined(&self) -> impl Iterator<Item = &str> {
        self.stdout.iter().chain(self.stderr.iter()).map(String::as_str)
    }
}

/// Kill-then-remove guard. Runs at most once; if never run explicitly, drop
/// schedules it on the current runtime.
pub struct Cleanup {
    runtime: Arc<dyn ContainerRuntime>,
    id: String,
    done: AtomicBool,
}

impl Cleanup {
    fn new(runtime: Arc<dyn ContainerRuntime>, id: String) -> Self { Self { runtime, id, done: AtomicBool::new(false) } }

    pub async fn run(&self) -> Result<(), CleanupError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errors = Vec::new();
        if let Err(e) = self.runtime.kill(&self.id).await { errors.push(format!("kill: {e:#}")); }
        if let Err(e) = self.runtime.remove(&self.id).await { errors.push(format!("remove: {e:#}")); }
        debug!(container = %self.id, errors = errors.len(), "sandbox: cleanup done");
        if errors.is_empty() { Ok(()) } else { Err(CleanupError { container: self.id.clone(), errors }) }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.id, "sandbox: cleanup skipped, no runtime");
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let id = self.id.clone();
        handle.spawn(async move {
            if let Err(e) = runtime.kill(&id).await {
                warn!(container = %id, error = %e, "sandbox: deferred kill failed");
            }
            if let Err(e) = runtime.remove(&id).await {
                warn!(container = %id, error = %e, "sandbox: deferred remove failed");
            }
        });
    }
}

/// Drives container lifecycles on one runtime.
#[derive(Clone)]
pub struct TaskExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    default_cpu: Option<String>,
    default_memory: Option<String>,
    log_cap: usize,
}

impl TaskExecutor {
    /// Resource defaults from `CONFLUX_SANDBOX_CPU` / `CONFLUX_SANDBOX_MEMORY`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            default_cpu: std::env::var("CONFLUX_SANDBOX_CPU").ok().filter(|s| !s.is_empty()),
            default_memory: std::env::var("CONFLUX_SANDBOX_MEMORY").ok().filter(|s| !s.is_empty()),
            log_cap: conflux_core::env_or("CONFLUX_LOG_QUEUE_CAP", 4096usize).max(1),
        }
    }

    pub fn with_limits(mut self, cpu: Option<String>, memory: Option<String>) -> Self {
        self.default_cpu = cpu;
        self.default_memory = memory;
        self
    }

    /// Pull `image` unless already present, bounded by the scope.
    pub async fn ensure_image(&self, scope: &TaskScope, image: &str) -> Result<(), SandboxError> {
        let work = async {
            if !self.runtime.image_present(image).await? {
                info!(image, "sandbox: pulling image");
                self.runtime.pull_image(image).await?;
            }
            Ok::<(), anyhow::Error>(())
        };
        tokio::select! {
            _ = scope.done() => Err(SandboxError::Timeout { stage: Stage::Pull }),
            res = work => res.map_err(SandboxError::at(Stage::Pull)),
        }
    }

    pub async fn create(
        &self,
        scope: &TaskScope,
        image: &str,
        name: &str,
        cpu: Option<String>,
        memory: Option<String>,
        env: Vec<(String, String)>,
    ) -> Result<(ContainerHandle, Cleanup), SandboxError> {
        let spec = ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            cpu: cpu.or_else(|| self.default_cpu.clone()),
            memory: memory.or_else(|| self.default_memory.clone()),
            env,
        };
        let id = tokio::select! {
            _ = scope.done() => return Err(SandboxError::Timeout { stage: Stage::Create }),
            res = self.runtime.create(&spec) => res.map_err(SandboxError::at(Stage::Create))?,
        };
        let cleanup = Cleanup::new(Arc::clone(&self.runtime), id.clone());
        Ok((ContainerHandle { id, name: name.to_string() }, cleanup))
    }

    pub async fn start(&self, scope: &TaskScope, handle: &ContainerHandle) -> Result<(), SandboxError> {
        tokio::select! {
            _ = scope.done() => Err(SandboxError::Timeout { stage: Stage::Start }),
            res = self.runtime.start(&handle.id) => res.map_err(SandboxError::at(Stage::Start)),
        }
    }

    /// Background wait raced against the scope. Deadline or cancel yields
    /// [`WaitOutcome::Cancelled`]; cleanup is still the caller's job.
    pub async fn wait_for_stop(&self, scope: &TaskScope, handle: &ContainerHandle) -> Result<WaitOutcome, SandboxError> {
        let runtime = Arc::clone(&self.runtime);
        let id = handle.id.clone();
        debug!(id = %handle.id, remaining_ms = scope.remaining().as_millis() as u64, "sandbox: waiting for stop");
        let mut waiter = tokio::spawn(async move { runtime.wait(&id).await });
        tokio::select! {
            _ = scope.done() => {
                waiter.abort();
                Ok(WaitOutcome::Cancelled)
            }
            joined = &mut waiter => match joined {
                Ok(Ok(code)) => Ok(WaitOutcome::Exited(code)),
                Ok(Err(e)) => Err(SandboxError::Failure { stage: Stage::Wait, source: e }),
                Err(e) => Err(SandboxError::Failure { stage: Stage::Wait, source: anyhow::anyhow!("wait task: {e}") }),
            },
        }
    }

    /// Two listeners (stdout, stderr) joined by completion; the scope
    /// aborts collection.
    pub async fn collect_logs(&self, scope: &TaskScope, handle: &ContainerHandle) -> Result<TaskLogs, SandboxError> {
        let LogStreams { stdout, stderr } = tokio::select! {
            _ = scope.done() => return Err(SandboxError::Timeout { stage: Stage::Logs }),
            res = self.runtime.logs(&handle.id) => res.map_err(SandboxError::at(Stage::Logs))?,
        };
        let listeners = scope.cancel.child_token();
        let (out_tx, out_rx) = mpsc::channel::<LogChunk>(self.log_cap);
        let (err_tx, err_rx) = mpsc::channel::<LogChunk>(self.log_cap);
        let out_ctx = format!("{}/stdout", handle.name);
        let err_ctx = format!("{}/stderr", handle.name);
        let (c1, c2) = (listeners.clone(), listeners.clone());
        tokio::spawn(async move { pump_bytes_to_lines(stdout, out_tx, c1, &out_ctx).await });
        tokio::spawn(async move { pump_bytes_to_lines(stderr, err_tx, c2, &err_ctx).await });

        let joined = async { tokio::join!(drain_lines(out_rx), drain_lines(err_rx)) };
        tokio::select! {
            biased;
            _ = scope.done() => {
                listeners.cancel();
                Err(SandboxError::Timeout { stage: Stage::Logs })
            }
            (stdout, stderr) = joined => Ok(TaskLogs { stdout, stderr }),
        }
    }

    /// Run `task` to completion and extract its single result line.
    /// Cleanup always runs; its errors are logged and never replace the
    /// task's own outcome.
    pub async fn run_task(&self, task: &Task, cancel: &CancellationToken) -> Result<Json, SandboxError> {
        let started = std::time::Instant::now();
        let scope = TaskScope::new(cancel, task.timeout);
        let data = base64::engine::general_purpose::STANDARD.encode(serde_json::to_vec(&task.input)?);
        let env = vec![(ENV_NAME.to_string(), task.name.clone()), (ENV_DATA.to_string(), data)];

        self.ensure_image(&scope, &task.image).await?;
        let (handle, cleanup) = self.create(&scope, &task.image, &task.name, task.cpu.clone(), task.memory.clone(), env).await?;
        let outcome = self.drive(&scope, &handle, task).await;
        if let Err(e) = cleanup.run().await {
            counter!("sandbox_cleanup_failures_total", 1u64);
            warn!(task = %task.name, error = %e, "sandbox: cleanup failed");
        }

        histogram!("sandbox_task_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &outcome {
            Ok(_) => info!(task = %task.name, image = %task.image, took_ms = %started.elapsed().as_millis(), "sandbox: task ok"),
            Err(e) => {
                counter!("sandbox_task_failures_total", 1u64);
                warn!(task = %task.name, image = %task.image, error = %e, "sandbox: task failed");
            }
        }
        outcome
    }

    async fn drive(&self, scope: &TaskScope, handle: &ContainerHandle, task: &Task) -> Result<Json, SandboxError> {
        self.start(scope, handle).await?;
        let code = match self.wait_for_stop(scope, handle).await? {
            WaitOutcome::Exited(code) => code,
            WaitOutcome::Cancelled => return Err(SandboxError::Timeout { stage: Stage::Wait }),
        };
        let logs = match self.collect_logs(scope, handle).await {
            Ok(logs) => logs,
            Err(e) if code != 0 => {
                warn!(task = %task.name, exit_code = code, error = %e, "sandbox: logs unavailable for failed task");
                TaskLogs::default()
            }
            Err(e) => return Err(e),
        };
        if code != 0 {
            let stderr = logs.stderr.iter().rev().take(20).rev().cloned().collect::<Vec<_>>().join("\n");
            return Err(SandboxError::TaskFailed { exit_code: code, stderr });
        }
        extract_result(&task.name, logs.combined())
    }
}
