//! Container runtime capability interface
//!
//! The orchestration core never talks to Docker directly; it goes through
//! this trait so that any runtime exposing equivalent primitives (create,
//! start, stop, remove, inspect, exec, volumes, networks, image pull)
//! satisfies it. Tests substitute an in-memory implementation.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Restart policy applied to a created container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    #[default]
    None,
    Always,
    UnlessStopped,
}

/// A container port published on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPublication {
    pub container_port: u16,
    pub host_port: u16,
}

/// Initial network attachment for a created container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name; empty means runtime-assigned
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    /// Volume bindings in `volume:/mount/point` form
    pub binds: Vec<String>,
    pub restart: RestartPolicy,
    pub published_port: Option<PortPublication>,
    pub network: Option<NetworkAttachment>,
}

/// Live state snapshot of an existing container
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub running: bool,
    pub restarting: bool,
    pub dead: bool,
    pub oom_killed: bool,
    /// Network name to aliases on that network
    pub networks: HashMap<String, Vec<String>>,
}

/// Combined output of an in-container command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: String,
}

/// A demultiplexed piece of a container's log stream
#[derive(Debug, Clone)]
pub enum LogChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type LogStream = BoxStream<'static, Result<LogChunk>>;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Pull an image unless it is already present locally
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container, returning its runtime handle
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stop a container, allowing it `grace` to shut down cleanly.
    /// Already-stopped and missing containers are not errors.
    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Force-remove a container; a missing container is not an error
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Block until a container exits, returning its exit status
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// Inspect a container; `None` means it no longer exists
    async fn inspect_container(&self, container_id: &str) -> Result<Option<ContainerDetails>>;

    /// Run a command inside a running container and capture combined output
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Stream demultiplexed stdout/stderr from a container
    async fn logs(&self, container_id: &str, follow: bool, tail: Option<u32>)
        -> Result<LogStream>;

    async fn create_volume(&self, name: &str, labels: &HashMap<String, String>) -> Result<()>;

    /// Force-remove a volume; a missing volume is not an error
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create the named bridge network if it does not already exist
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Attach a container to a network under the given aliases.
    /// An existing attachment is not an error.
    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        aliases: &[String],
    ) -> Result<()>;
}
