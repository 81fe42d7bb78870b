//! Bounded, non-blocking hook dispatch.
//!
//! `dispatch` only ever `try_send`s into a bounded queue; a full queue drops
//! the job with a warning. One intake task drains the queue and runs each job
//! on its own task under a semaphore of `workers` permits. Every outcome is
//! broadcast and logged by a supervisor task.

use std::sync::Arc;
use std::time::Instant;

use conflux_core::{env_or, Hook, Params};
use metrics::counter;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::hook::HookRegistry;

#[derive(Debug, Clone)]
pub struct HookJob {
    pub hook: Hook,
    pub params: Params,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutcome {
    pub kind: String,
    pub ok: bool,
    pub error: Option<String>,
    pub took_ms: u64,
}

pub struct HookDispatcher {
    tx: mpsc::Sender<HookJob>,
    outcomes: broadcast::Sender<HookOutcome>,
    intake: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl HookDispatcher {
    /// Start with limits from `CONFLUX_HOOK_WORKERS` (4) and `CONFLUX_HOOK_QUEUE_CAP` (256).
    /// Must be called inside a tokio runtime.
    pub fn start(registry: Arc<HookRegistry>) -> Self {
        let workers = env_or("CONFLUX_HOOK_WORKERS", 4usize);
        let queue_cap = env_or("CONFLUX_HOOK_QUEUE_CAP", 256usize);
        Self::with_limits(registry, workers, queue_cap)
    }

    pub fn with_limits(registry: Arc<HookRegistry>, workers: usize, queue_cap: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<HookJob>(queue_cap.max(1));
        let (outcomes, _) = broadcast::channel::<HookOutcome>(queue_cap.max(16));
        let supervisor = tokio::spawn(supervise(outcomes.subscribe()));
        let intake = tokio::spawn(intake(registry, rx, outcomes.clone(), workers));
        info!(workers, queue_cap, "hooks: dispatcher started");
        Self { tx, outcomes, intake, supervisor }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HookOutcome> { self.outcomes.subscribe() }

    /// Enqueue every hook for `params`. Never blocks; returns how many were accepted.
    pub fn dispatch(&self, hooks: &[Hook], params: &Params) -> usize {
        let mut accepted = 0;
        for hook in hooks {
            let job = HookJob { hook: hook.clone(), params: params.clone() };
            match self.tx.try_send(job) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(job)) => {
                    counter!("hook_dropped_total", 1u64, "reason" => "full");
                    warn!(kind = %job.hook.kind, "hooks: queue full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    counter!("hook_dropped_total", 1u64, "reason" => "closed");
                    warn!(kind = %job.hook.kind, "hooks: dispatcher closed, dropping");
                }
            }
        }
        accepted
    }

    /// Stop accepting jobs and wait for queued and in-flight hooks to finish.
    pub async fn shutdown(self) {
        let HookDispatcher { tx, outcomes, intake, supervisor } = self;
        drop(tx);
        if let Err(e) = intake.await {
            warn!(error = %e, "hooks: intake task failed");
        }
        drop(outcomes);
        let _ = supervisor.await;
    }
}

async fn intake(registry: Arc<HookRegistry>, mut rx: mpsc::Receiver<HookJob>, outcomes: broadcast::Sender<HookOutcome>, workers: usize) {
    let sem = Arc::new(Semaphore::new(workers));
    while let Some(job) = rx.recv().await {
        let Ok(permit) = Arc::clone(&sem).acquire_owned().await else { break };
        let registry = Arc::clone(&registry);
        let outcomes = outcomes.clone();
        tokio::spawn(async move {
            let outcome = run_job(&registry, job).await;
            let _ = outcomes.send(outcome);
            drop(permit);
        });
    }
    // Drain in-flight jobs before returning.
    let _ = sem.acquire_many(workers as u32).await;
}

async fn run_job(registry: &HookRegistry, job: HookJob) -> HookOutcome {
    let t0 = Instant::now();
    let kind = job.hook.kind.clone();
    let res = match registry.build(&job.hook, &job.params) {
        Ok(hook) => hook.execute().await,
        Err(e) => Err(e.into()),
    };
    HookOutcome {
        kind,
        ok: res.is_ok(),
        error: res.err().map(|e| format!("{e:#}")),
        took_ms: t0.elapsed().as_millis() as u64,
    }
}

async fn supervise(mut rx: broadcast::Receiver<HookOutcome>) {
    loop {
        match rx.recv().await {
            Ok(o) if o.ok => {
                counter!("hook_outcomes_total", 1u64, "outcome" => "ok");
                info!(kind = %o.kind, took_ms = o.took_ms, "hooks: ok");
            }
            Ok(o) => {
                counter!("hook_outcomes_total", 1u64, "outcome" => "failed");
                warn!(kind = %o.kind, took_ms = o.took_ms, error = %o.error.as_deref().unwrap_or(""), "hooks: failed");
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "hooks: supervisor lagged"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
