//! Deployment provider running as a child process.
//!
//! The provider is invoked as `<program> up|down`, receives one JSON request
//! on stdin, and reports one JSON [`DeploymentEvent`] per stdout line.
//! Stderr lines and a non-zero exit status become errors.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Attributes, DeployError, DeployRequest, DeploymentEvent, DeploymentProvider,
    DeploymentStreams,
};
use crate::spec::DeploymentSpec;

#[derive(Debug, Clone)]
pub struct ProviderProcess {
    program: PathBuf,
}

impl ProviderProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, request: DeployRequest) -> Result<DeploymentStreams, DeployError> {
        let payload = serde_json::to_vec(&request)?;
        let mut child = Command::new(&self.program)
            .arg(request.operation())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeployError::Spawn {
                provider: self.program.clone(),
                source,
            })?;
        debug!(provider = %self.program.display(), operation = request.operation(), "Deployment provider started");

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.write_all(b"\n").await?;
            stdin.shutdown().await?;
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();

        let stderr_task = child.stderr.take().map(|stderr| {
            let error_tx = error_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        let _ = error_tx.send(DeployError::Provider(line));
                    }
                }
            })
        });

        let stdout = child.stdout.take();
        tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if let Some(event) = parse_event(&line) {
                                let _ = event_tx.send(event);
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            let _ = error_tx.send(DeployError::Io(err));
                            break;
                        }
                    }
                }
            }
            drop(event_tx);

            if let Some(task) = stderr_task {
                let _ = task.await;
            }
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    warn!(%status, "Deployment provider failed");
                    let _ = error_tx.send(DeployError::Exit(status.to_string()));
                }
                Err(err) => {
                    let _ = error_tx.send(DeployError::Io(err));
                }
            }
        });

        Ok(DeploymentStreams { events, errors })
    }
}

/// JSON events are decoded; any other non-empty line is relayed as text.
fn parse_event(line: &str) -> Option<DeploymentEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(line).unwrap_or_else(|_| DeploymentEvent::Message {
            message: line.to_string(),
        }),
    )
}

#[async_trait]
impl DeploymentProvider for ProviderProcess {
    async fn up(
        &self,
        spec: &DeploymentSpec,
        attributes: &Attributes,
    ) -> Result<DeploymentStreams, DeployError> {
        self.run(DeployRequest::Up {
            spec: spec.clone(),
            attributes: attributes.clone(),
        })
        .await
    }

    async fn down(&self, attributes: &Attributes) -> Result<DeploymentStreams, DeployError> {
        self.run(DeployRequest::Down {
            attributes: attributes.clone(),
        })
        .await
    }
}
