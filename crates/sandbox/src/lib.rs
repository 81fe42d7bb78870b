//! Conflux sandbox: runs one ephemeral, resource-bounded container per task.
//!
//! Input goes in through `SYNTH_NAME`/`DATA` env vars; the result comes back
//! as exactly one `<name>: <json>` line in the container's combined output.

#![forbid(unsafe_code)]

pub mod error;
pub mod executor;
pub mod k8s;
#[cfg(feature = "mock")]
pub mod mock;
pub mod pump;
pub mod result;
pub mod runtime;

pub use error::{CleanupError, SandboxError, Stage};
pub use executor::{Cleanup, ContainerHandle, Task, TaskExecutor, TaskLogs, TaskScope, WaitOutcome, ENV_DATA, ENV_NAME};
pub use k8s::KubeRuntime;
#[cfg(feature = "mock")]
pub use mock::{MockRun, MockRuntime};
pub use pump::LogChunk;
pub use result::extract_result;
pub use runtime::{ByteStream, ContainerRuntime, ContainerSpec, LogStreams};
