//! Deployment client
//!
//! Hands a synthesized spec to an out-of-process deployment provider and
//! relays its progress. Providers are external; kiln only defines the
//! request and event shapes and how the two streams are consumed.

pub mod process;

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::spec::DeploymentSpec;

pub use process::ProviderProcess;

/// Free-form stack attributes passed to the provider (region, project id, ...).
pub type Attributes = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("failed to start deployment provider {}: {source}", .provider.display())]
    Spawn {
        provider: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("deployment provider I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode deployment request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("deployment provider: {0}")]
    Provider(String),

    #[error("deployment provider exited with {0}")]
    Exit(String),
}

/// Request written to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DeployRequest {
    Up {
        spec: DeploymentSpec,
        attributes: Attributes,
    },
    Down {
        attributes: Attributes,
    },
}

impl DeployRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Up { .. } => "up",
            Self::Down { .. } => "down",
        }
    }
}

/// Progress reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploymentEvent {
    Message {
        message: String,
    },
    Result {
        success: bool,
        #[serde(default)]
        message: String,
    },
}

/// Event and error streams of one provider operation. Both close when the
/// provider is done.
pub struct DeploymentStreams {
    pub events: mpsc::UnboundedReceiver<DeploymentEvent>,
    pub errors: mpsc::UnboundedReceiver<DeployError>,
}

impl DeploymentStreams {
    /// Consume both streams, calling `on_event` for every event, and return
    /// the errors that were reported.
    pub async fn relay(mut self, mut on_event: impl FnMut(&DeploymentEvent)) -> Vec<DeployError> {
        let mut errors = Vec::new();
        let mut events_open = true;
        let mut errors_open = true;
        while events_open || errors_open {
            tokio::select! {
                event = self.events.recv(), if events_open => match event {
                    Some(event) => on_event(&event),
                    None => events_open = false,
                },
                error = self.errors.recv(), if errors_open => match error {
                    Some(error) => errors.push(error),
                    None => errors_open = false,
                },
            }
        }
        errors
    }
}

#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    async fn up(
        &self,
        spec: &DeploymentSpec,
        attributes: &Attributes,
    ) -> Result<DeploymentStreams, DeployError>;

    async fn down(&self, attributes: &Attributes) -> Result<DeploymentStreams, DeployError>;
}

/// Read stack attributes from a TOML file.
pub fn load_attributes(path: &Path) -> anyhow::Result<Attributes> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read stack file: {}", path.display()))?;
    parse_attributes(&content)
        .with_context(|| format!("Failed to parse stack file: {}", path.display()))
}

pub fn parse_attributes(content: &str) -> anyhow::Result<Attributes> {
    let table: toml::Table = toml::from_str(content)?;
    match serde_json::to_value(table)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("stack attributes must be a table"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_convert_from_toml() {
        let attributes = parse_attributes(
            r#"
region = "eu-west-1"
replicas = 2

[tags]
team = "shop"
"#,
        )
        .unwrap();
        assert_eq!(attributes["region"], "eu-west-1");
        assert_eq!(attributes["replicas"], 2);
        assert_eq!(attributes["tags"]["team"], "shop");
    }

    #[test]
    fn events_use_kind_tags() {
        let event: DeploymentEvent =
            serde_json::from_str(r#"{"kind":"result","success":true}"#).unwrap();
        assert_eq!(
            event,
            DeploymentEvent::Result {
                success: true,
                message: String::new()
            }
        );
    }

    #[tokio::test]
    async fn relay_drains_both_streams() {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        event_tx
            .send(DeploymentEvent::Message {
                message: "creating bucket".to_string(),
            })
            .unwrap();
        error_tx
            .send(DeployError::Provider("quota exceeded".to_string()))
            .unwrap();
        drop(event_tx);
        drop(error_tx);

        let mut seen = Vec::new();
        let errors = DeploymentStreams { events, errors }
            .relay(|event| seen.push(event.clone()))
            .await;
        assert_eq!(seen.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
