use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{RunContext, RunUpdate, ServiceRunner};
use crate::project::Service;
use crate::sandbox::output::{self, OutputTail};
use crate::sandbox::service_env;
use crate::types::Stage;

/// Runs each service's start command as a child process.
pub struct ProcessRunner {
    root: PathBuf,
}

impl ProcessRunner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn forward_lines<R>(reader: R, service: &str, ctx: &RunContext, tail: &OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let service = service.to_string();
    let ctx = ctx.clone();
    output::capture_lines(reader, tail.clone(), move |line| {
        ctx.report(RunUpdate::running(&service, line));
    })
}

#[cfg(unix)]
fn interrupt(child: &Child) -> anyhow::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = child.id().context("process has already exited")?;
    let pid = i32::try_from(pid).context("process id out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGINT).context("Failed to send SIGINT")?;
    Ok(())
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> anyhow::Result<()> {
    anyhow::bail!("interrupting processes is not supported on this platform")
}

/// Interrupt the child, then kill it if it has not exited in time.
async fn stop(child: &mut Child, ctx: &RunContext, service: &str) -> anyhow::Result<ExitStatus> {
    match interrupt(child) {
        Ok(()) => {
            if let Ok(status) = tokio::time::timeout(ctx.stop_timeout, child.wait()).await {
                return Ok(status?);
            }
            warn!(service = %service, "Service ignored interrupt, killing it");
        }
        Err(err) => debug!(service = %service, error = %err, "Interrupt failed, killing process"),
    }
    child.kill().await.context("Failed to kill process")?;
    Ok(child.wait().await?)
}

#[async_trait]
impl ServiceRunner for ProcessRunner {
    async fn run(&self, service: &Service, ctx: RunContext) -> anyhow::Result<()> {
        let argv = service
            .start_command()
            .with_context(|| format!("service {} has no start command", service.name))?;
        let address = format!("127.0.0.1:{}", ctx.port);

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.root)
            .envs(service_env(Stage::Run, &address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", argv[0]))?;
        debug!(service = %service.name, pid = ?child.id(), "Process started");

        let tail = OutputTail::new(ctx.log_tail);
        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(stdout, &service.name, &ctx, &tail));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(stderr, &service.name, &ctx, &tail));
        }

        let (status, stopped) = tokio::select! {
            status = child.wait() => (status.context("Failed to wait for process")?, false),
            _ = ctx.cancel.cancelled() => (stop(&mut child, &ctx, &service.name).await?, true),
        };

        // Background processes may still hold the pipes open.
        output::drain(forwarders).await;

        if stopped || status.success() {
            return Ok(());
        }
        anyhow::bail!("exited with {}:\n{}", status, tail.render())
    }
}
