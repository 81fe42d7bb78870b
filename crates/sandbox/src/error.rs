use std::fmt;

/// Lifecycle stage a sandbox failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage { Pull, Create, Start, Wait, Logs }

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Pull => "pull",
            Stage::Create => "create",
            Stage::Start => "start",
            Stage::Wait => "wait",
            Stage::Logs => "logs",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox {stage} failed: {source:#}")]
    Failure { stage: Stage, source: anyhow::Error },
    #[error("sandbox task exceeded its deadline during {stage}")]
    Timeout { stage: Stage },
    #[error("result extraction failed: {0}")]
    ResultExtractionFailed(String),
    #[error("task exited with code {exit_code}: {stderr}")]
    TaskFailed { exit_code: i64, stderr: String },
    #[error("invalid task input: {0}")]
    Input(#[from] serde_json::Error),
}

impl SandboxError {
    pub(crate) fn at(stage: Stage) -> impl FnOnce(anyhow::Error) -> SandboxError {
        move |source| SandboxError::Failure { stage, source }
    }
}

/// Kill/remove sub-errors collected during cleanup.
#[derive(Debug, thiserror::Error)]
#[error("cleanup of {container} failed: {}", .errors.join("; "))]
pub struct CleanupError {
    pub container: String,
    pub errors: Vec<String>,
}
