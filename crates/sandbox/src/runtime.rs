//! Container runtime interface consumed by the task executor.

use anyhow::Result;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Raw log bytes from one output channel of a container.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Isolated process spec. `cpu`/`memory` use runtime quantity syntax
/// (e.g. `"500m"`, `"256Mi"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub env: Vec<(String, String)>,
}

pub struct LogStreams {
    pub stdout: ByteStream,
    pub stderr: ByteStream,
}

/// Lifecycle primitives of a container engine. `kill` and `remove` of a
/// container that no longer exists succeed.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_present(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Returns the runtime's id for the new container.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Block until the container stops; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;
    async fn logs(&self, id: &str) -> Result<LogStreams>;
    async fn kill(&self, id: &str) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
}
