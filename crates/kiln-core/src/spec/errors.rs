use std::fmt;

use crate::collect::ServiceErrors;
use crate::rpc::messages::{HttpMethod, WebsocketEventType};

/// Cross-service violation found while merging requirements.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectError {
    #[error("schedule '{name}' registered by {service} is already registered by {existing}")]
    DuplicateSchedule {
        name: String,
        service: String,
        existing: String,
    },

    #[error(
        "websocket '{socket}' {event} handler registered by {service} is already handled by {existing}"
    )]
    DuplicateWebsocketHandler {
        socket: String,
        event: WebsocketEventType,
        service: String,
        existing: String,
    },

    #[error("websocket '{socket}' is missing {} handler(s)", join(.missing))]
    IncompleteWebsocket {
        socket: String,
        missing: Vec<WebsocketEventType>,
    },

    #[error(
        "route {method} {path} on API '{api}' registered by {service} overlaps a route registered by {existing}"
    )]
    OverlappingRoute {
        api: String,
        method: HttpMethod,
        path: String,
        service: String,
        existing: String,
    },

    #[error("security definition '{name}' on API '{api}' uses an unsupported scheme")]
    UnsupportedSecurityScheme { api: String, name: String },
}

fn join(items: &[WebsocketEventType]) -> String {
    items
        .iter()
        .map(WebsocketEventType::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Accumulated project-level violations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectErrors {
    errors: Vec<ProjectError>,
}

impl ProjectErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ProjectError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ProjectError] {
        &self.errors
    }

    /// `Err(self)` when anything was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for ProjectErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "project has {} error(s):", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProjectErrors {}

/// Synthesis could not run at all.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("{}", describe_services(.0))]
    InvalidRequirements(Vec<ServiceErrors>),

    #[error("failed to encode policy: {0}")]
    PolicyEncoding(#[from] serde_json::Error),
}

fn describe_services(errors: &[ServiceErrors]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_websocket_names_missing_handlers() {
        let err = ProjectError::IncompleteWebsocket {
            socket: "chat".to_string(),
            missing: vec![WebsocketEventType::Disconnect, WebsocketEventType::Message],
        };
        assert_eq!(
            err.to_string(),
            "websocket 'chat' is missing disconnect, message handler(s)"
        );
    }

    #[test]
    fn project_errors_join_every_violation() {
        let mut errors = ProjectErrors::new();
        errors.push(ProjectError::UnsupportedSecurityScheme {
            api: "public".to_string(),
            name: "basic".to_string(),
        });
        errors.push(ProjectError::DuplicateSchedule {
            name: "nightly".to_string(),
            service: "b".to_string(),
            existing: "a".to_string(),
        });
        let text = errors.to_string();
        assert!(text.starts_with("project has 2 error(s):"));
        assert!(text.contains("'basic'"));
        assert!(text.contains("schedule 'nightly'"));
    }
}
