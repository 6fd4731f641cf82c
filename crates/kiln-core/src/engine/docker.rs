//! Container engine backed by the `docker` command line client.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use super::{ContainerEngine, ContainerSpec, ImageBuild};

const OUTPUT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a docker subcommand to completion and return its trimmed stdout.
    async fn output(&self, args: &[String]) -> anyhow::Result<String> {
        debug!(args = ?args, "Running docker");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_piped(&self, args: &[String]) -> anyhow::Result<Child> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.binary.display()))
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn build(
        &self,
        build: ImageBuild<'_>,
        log: &mut (dyn Write + Send),
    ) -> anyhow::Result<()> {
        let mut args = vec![
            "build".to_string(),
            "--progress".to_string(),
            "plain".to_string(),
            "-f".to_string(),
            build.dockerfile.to_string_lossy().to_string(),
            "-t".to_string(),
            build.tag.to_string(),
        ];
        for (key, value) in build.build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(build.context.to_string_lossy().to_string());

        let mut child = self.spawn_piped(&args)?;
        let mut output = combined_output(&mut child);
        while let Some(chunk) = output.recv().await {
            log.write_all(&chunk)?;
        }
        log.flush()?;

        let status = child.wait().await.context("Failed to wait for docker build")?;
        if !status.success() {
            anyhow::bail!("docker build for {} exited with {}", build.tag, status);
        }
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];
        if let Some(name) = &spec.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for host in &spec.extra_hosts {
            args.push("--add-host".to_string());
            args.push(host.clone());
        }
        for (host_port, container_port) in &spec.ports {
            args.push("--publish".to_string());
            args.push(format!("{host_port}:{container_port}"));
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        self.output(&args)
            .await
            .with_context(|| format!("Failed to start container from {}", spec.image))
    }

    async fn attach(&self, id: &str) -> anyhow::Result<mpsc::Receiver<Vec<u8>>> {
        let args = vec!["logs".to_string(), "--follow".to_string(), id.to_string()];
        let mut child = self.spawn_piped(&args)?;
        let output = combined_output(&mut child);
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(output)
    }

    async fn wait(&self, id: &str) -> anyhow::Result<i64> {
        let code = self
            .output(&["wait".to_string(), id.to_string()])
            .await?;
        code.parse::<i64>()
            .with_context(|| format!("Unexpected exit code from docker wait: {code}"))
    }

    async fn stop(&self, id: &str, timeout: Duration) -> anyhow::Result<()> {
        self.output(&[
            "stop".to_string(),
            "--time".to_string(),
            timeout.as_secs().to_string(),
            id.to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn kill(&self, id: &str) -> anyhow::Result<()> {
        self.output(&["kill".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn logs(&self, id: &str, tail: usize) -> anyhow::Result<String> {
        let output = Command::new(&self.binary)
            .args(["logs", "--tail", &tail.to_string(), id])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to read logs for container {id}"))?;
        // docker logs replays the container's stderr on its own stderr
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.output(&["rm".to_string(), "--force".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }
}

/// Merge a child's stdout and stderr into one chunk stream.
fn combined_output(child: &mut Child) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, tx));
    }
    rx
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
