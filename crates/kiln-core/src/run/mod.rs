//! Service run orchestration
//!
//! Runs every service concurrently against the local emulation endpoint.
//! One parent [`CancellationToken`] fans out to a child token per service,
//! so a single stop request reaches all of them.

pub mod container;
pub mod process;

use std::fmt;
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunSettings;
use crate::project::Service;

pub use container::ContainerRunner;
pub use process::ProcessRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Done,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunUpdate {
    pub service_name: String,
    pub message: String,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunUpdate {
    pub fn running(service_name: &str, message: impl Into<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            message: message.into(),
            status: RunStatus::Running,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Run built images instead of start commands
    pub use_containers: bool,
    /// Output lines reported when a service fails
    pub log_tail: usize,
    /// Grace period after a stop request before the service is killed
    pub stop_timeout: Duration,
    /// Emulation endpoint port; 0 allocates a free one
    pub port: u16,
    /// Working directory for start commands
    pub root: PathBuf,
}

impl RunOptions {
    pub fn from_settings(settings: &RunSettings, root: impl Into<PathBuf>) -> Self {
        Self {
            use_containers: settings.containers,
            log_tail: settings.log_tail,
            stop_timeout: Duration::from_secs(settings.stop_timeout_secs),
            port: settings.port,
            root: root.into(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default(), ".")
    }
}

/// Everything a runner needs for one service.
#[derive(Clone)]
pub struct RunContext {
    pub port: u16,
    pub updates: UnboundedSender<RunUpdate>,
    pub cancel: CancellationToken,
    pub log_tail: usize,
    pub stop_timeout: Duration,
}

impl RunContext {
    pub fn report(&self, update: RunUpdate) {
        let _ = self.updates.send(update);
    }
}

#[async_trait]
pub trait ServiceRunner: Send + Sync {
    /// Run `service` until it exits or `ctx.cancel` fires.
    ///
    /// Output is reported as `Running` updates. A stop request that ends the
    /// service is a clean exit.
    async fn run(&self, service: &Service, ctx: RunContext) -> anyhow::Result<()>;
}

/// The requested port, or a free loopback port when `requested` is 0.
pub fn resolve_port(requested: u16) -> std::io::Result<u16> {
    if requested != 0 {
        return Ok(requested);
    }
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Run every service until all have exited.
///
/// Each service's terminal `Done` or `Error` update is sent before this
/// returns. Every run is awaited; the first failure in service order is
/// returned.
pub async fn run_services(
    services: &[Service],
    runner: Arc<dyn ServiceRunner>,
    options: &RunOptions,
    updates: UnboundedSender<RunUpdate>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let port = resolve_port(options.port).context("Failed to allocate a local port")?;
    info!(services = services.len(), port, "Running services");

    let mut tasks = JoinSet::new();
    for (index, service) in services.iter().cloned().enumerate() {
        let ctx = RunContext {
            port,
            updates: updates.clone(),
            cancel: cancel.child_token(),
            log_tail: options.log_tail,
            stop_timeout: options.stop_timeout,
        };
        let runner = Arc::clone(&runner);
        tasks.spawn(async move {
            let result = run_one(runner.as_ref(), &service, ctx).await;
            (index, result)
        });
    }

    let mut failures: Vec<(usize, anyhow::Error)> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((index, Err(err))) => failures.push((index, err)),
            Err(err) => failures.push((usize::MAX, anyhow::anyhow!("service task failed: {err}"))),
        }
    }

    failures.sort_by_key(|(index, _)| *index);
    match failures.into_iter().next() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

async fn run_one(runner: &dyn ServiceRunner, service: &Service, ctx: RunContext) -> anyhow::Result<()> {
    ctx.report(RunUpdate::running(&service.name, "Starting"));
    debug!(service = %service.name, port = ctx.port, "Starting service");

    let updates = ctx.updates.clone();
    let result = runner.run(service, ctx).await;
    let update = match &result {
        Ok(()) => {
            info!(service = %service.name, "Service stopped");
            RunUpdate {
                service_name: service.name.clone(),
                message: "Stopped".to_string(),
                status: RunStatus::Done,
                error: None,
            }
        }
        Err(err) => {
            warn!(service = %service.name, error = %format!("{err:#}"), "Service failed");
            RunUpdate {
                service_name: service.name.clone(),
                message: "Failed".to_string(),
                status: RunStatus::Error,
                error: Some(format!("{err:#}")),
            }
        }
    };
    let _ = updates.send(update);
    result.with_context(|| format!("service {} failed", service.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_port_is_kept() {
        assert_eq!(resolve_port(4000).unwrap(), 4000);
        assert_ne!(resolve_port(0).unwrap(), 0);
    }

    #[test]
    fn options_follow_settings() {
        let settings = RunSettings {
            containers: true,
            log_tail: 5,
            stop_timeout_secs: 3,
            port: 50051,
        };
        let options = RunOptions::from_settings(&settings, "/srv/shop");
        assert!(options.use_containers);
        assert_eq!(options.stop_timeout, Duration::from_secs(3));
        assert_eq!(options.root, PathBuf::from("/srv/shop"));
    }
}
