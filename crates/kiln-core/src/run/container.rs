use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{RunContext, RunUpdate, ServiceRunner};
use crate::engine::{ContainerEngine, ContainerSpec};
use crate::project::Service;
use crate::sandbox::{HOST_GATEWAY, output, service_env};
use crate::types::{CONTAINER_HOST, Stage};

/// Runs each service from its built image.
pub struct ContainerRunner {
    engine: Arc<dyn ContainerEngine>,
}

impl ContainerRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    fn spec(service: &Service, port: u16) -> ContainerSpec {
        ContainerSpec {
            image: service.image_tag(),
            env: service_env(Stage::Run, &format!("{CONTAINER_HOST}:{port}")),
            extra_hosts: vec![HOST_GATEWAY.to_string()],
            ..Default::default()
        }
    }

    async fn shut_down(&self, id: &str, ctx: &RunContext) {
        if let Err(err) = self.engine.stop(id, ctx.stop_timeout).await {
            warn!(container = %id, error = %err, "Graceful stop failed, killing container");
            if let Err(err) = self.engine.kill(id).await {
                warn!(container = %id, error = %err, "Failed to kill container");
            }
        }
    }
}

#[async_trait]
impl ServiceRunner for ContainerRunner {
    async fn run(&self, service: &Service, ctx: RunContext) -> anyhow::Result<()> {
        let id = self
            .engine
            .start(&Self::spec(service, ctx.port))
            .await
            .with_context(|| format!("Failed to start container for {}", service.name))?;
        debug!(service = %service.name, container = %id, "Container started");

        let mut chunks = self.engine.attach(&id).await?;
        let forward_ctx = ctx.clone();
        let name = service.name.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                let text = String::from_utf8_lossy(&chunk);
                let text = text.trim_end();
                if !text.is_empty() {
                    forward_ctx.report(RunUpdate::running(&name, text));
                }
            }
        });

        let exit = tokio::select! {
            code = self.engine.wait(&id) => Some(code),
            _ = ctx.cancel.cancelled() => None,
        };

        let result = match exit {
            None => {
                self.shut_down(&id, &ctx).await;
                Ok(())
            }
            Some(Ok(0)) => Ok(()),
            Some(Ok(code)) => {
                let logs = self.engine.logs(&id, ctx.log_tail).await.unwrap_or_default();
                Err(anyhow::anyhow!(
                    "exited with code {}:\n{}",
                    code,
                    logs.trim_end()
                ))
            }
            Some(Err(err)) => Err(err.context("Failed to wait for container")),
        };

        // Output may still be in flight after exit.
        output::drain(vec![forwarder]).await;
        if let Err(err) = self.engine.remove(&id).await {
            debug!(container = %id, error = %err, "Failed to remove container");
        }
        result
    }
}
