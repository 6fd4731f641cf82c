//! Sandboxed execution for requirement collection.
//!
//! A sandbox runs one service pointed at a collection endpoint instead of
//! its real runtime endpoint and returns once the service exits.

pub mod output;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::engine::{ContainerEngine, ContainerSpec};
use crate::project::Service;
use crate::types::{CONTAINER_HOST, ENVIRONMENT_ENV, SERVICE_ADDRESS_ENV, Stage};

pub use output::{OUTPUT_DRAIN, OutputTail};

/// Extra host entry that lets containers reach services on the host.
pub const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

/// Lines of output included in collection failure reports.
pub const DEFAULT_LOG_TAIL: usize = 20;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `service` in collection mode until it exits.
    ///
    /// `endpoint` is the local address of the service's collection server.
    async fn run_collection(&self, service: &Service, endpoint: SocketAddr) -> anyhow::Result<()>;

    /// Whether the collection server must accept connections from outside
    /// the loopback interface.
    fn needs_public_bind(&self) -> bool {
        false
    }
}

/// Environment telling a service where its resource endpoint lives.
pub fn service_env(stage: Stage, address: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SERVICE_ADDRESS_ENV.to_string(), address.to_string()),
        (ENVIRONMENT_ENV.to_string(), stage.as_str().to_string()),
    ])
}

/// Runs the service's built image.
pub struct ContainerSandbox {
    engine: Arc<dyn ContainerEngine>,
    log_tail: usize,
}

impl ContainerSandbox {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            log_tail: DEFAULT_LOG_TAIL,
        }
    }

    pub fn with_log_tail(mut self, log_tail: usize) -> Self {
        self.log_tail = log_tail;
        self
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn run_collection(&self, service: &Service, endpoint: SocketAddr) -> anyhow::Result<()> {
        let address = format!("{CONTAINER_HOST}:{}", endpoint.port());
        let spec = ContainerSpec {
            image: service.image_tag(),
            env: service_env(Stage::Build, &address),
            extra_hosts: vec![HOST_GATEWAY.to_string()],
            ..Default::default()
        };

        let id = self
            .engine
            .start(&spec)
            .await
            .with_context(|| format!("Failed to start container for {}", service.name))?;
        debug!(service = %service.name, container = %id, "Collection container started");

        let result = async {
            let code = self.engine.wait(&id).await?;
            if code != 0 {
                let logs = self.engine.logs(&id, self.log_tail).await.unwrap_or_default();
                anyhow::bail!(
                    "service {} exited with code {} during collection:\n{}",
                    service.name,
                    code,
                    logs.trim_end()
                );
            }
            Ok(())
        }
        .await;

        if let Err(err) = self.engine.remove(&id).await {
            debug!(service = %service.name, error = %err, "Failed to remove collection container");
        }
        result
    }

    fn needs_public_bind(&self) -> bool {
        true
    }
}

/// Runs the service's start command as a local child process.
pub struct ProcessSandbox {
    root: PathBuf,
    log_tail: usize,
}

impl ProcessSandbox {
    /// `root` is the working directory for every start command.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            log_tail: DEFAULT_LOG_TAIL,
        }
    }

    pub fn with_log_tail(mut self, log_tail: usize) -> Self {
        self.log_tail = log_tail;
        self
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn run_collection(&self, service: &Service, endpoint: SocketAddr) -> anyhow::Result<()> {
        let argv = service
            .start_command()
            .with_context(|| format!("service {} has no start command", service.name))?;
        let address = format!("127.0.0.1:{}", endpoint.port());

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.root)
            .envs(service_env(Stage::Build, &address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {} for {}", argv[0], service.name))?;

        let tail = OutputTail::new(self.log_tail);
        let readers: Vec<_> = [
            child.stdout.take().map(|out| output::capture_lines(out, tail.clone(), |_| {})),
            child.stderr.take().map(|err| output::capture_lines(err, tail.clone(), |_| {})),
        ]
        .into_iter()
        .flatten()
        .collect();

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", service.name))?;
        output::drain(readers).await;

        if !status.success() {
            anyhow::bail!(
                "service {} exited with {} during collection:\n{}",
                service.name,
                status,
                tail.render()
            );
        }
        Ok(())
    }
}
