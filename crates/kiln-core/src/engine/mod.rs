//! Container engine abstraction.
//!
//! The engine is an external collaborator: kiln only needs to build an image
//! from a context and to start, observe, and stop containers. [`DockerCli`]
//! drives the `docker` binary; tests substitute in-memory engines.

pub mod docker;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use docker::DockerCli;

/// Inputs for an image build.
#[derive(Debug, Clone, Copy)]
pub struct ImageBuild<'a> {
    /// Path of the materialized Dockerfile.
    pub dockerfile: &'a Path,
    /// Build context directory.
    pub context: &'a Path,
    /// Tag for the resulting image.
    pub tag: &'a str,
    pub build_args: &'a BTreeMap<String, String>,
}

/// Container launch description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub env: BTreeMap<String, String>,
    /// `host:ip` entries added to the container's hosts file.
    pub extra_hosts: Vec<String>,
    /// `(host_port, container_port)` mappings.
    pub ports: Vec<(u16, u16)>,
    pub command: Vec<String>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image, writing raw build output to `log`.
    async fn build(
        &self,
        build: ImageBuild<'_>,
        log: &mut (dyn Write + Send),
    ) -> anyhow::Result<()>;

    /// Create and start a container, returning its id.
    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<String>;

    /// Stream combined stdout/stderr output chunks until the container exits.
    async fn attach(&self, id: &str) -> anyhow::Result<mpsc::Receiver<Vec<u8>>>;

    /// Wait for the container to exit and return its exit code.
    async fn wait(&self, id: &str) -> anyhow::Result<i64>;

    /// Ask the container to stop, killing it after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> anyhow::Result<()>;

    async fn kill(&self, id: &str) -> anyhow::Result<()>;

    /// Last `tail` lines of the container's output.
    async fn logs(&self, id: &str, tail: usize) -> anyhow::Result<String>;

    async fn remove(&self, id: &str) -> anyhow::Result<()>;
}
