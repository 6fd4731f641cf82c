//! Deployment spec
//!
//! The provider-agnostic description of every resource a project needs,
//! synthesized from the requirements each service declared during
//! collection. Resources serialize as `{name, type, config}`.

pub mod errors;
pub mod openapi;
pub mod policy;
pub mod synth;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rpc::messages::{BlobEventType, ScheduleCadence};
use crate::types::{Action, ResourceIdentifier, ResourceType};

pub use errors::{ProjectError, ProjectErrors, SynthesisError};
pub use openapi::OpenApiDocument;
pub use synth::{Synthesis, synthesize};

/// Ordered list of resources handed to a deployment provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub resources: Vec<Resource>,
}

impl DeploymentSpec {
    pub fn find(&self, kind: ResourceType, name: &str) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.kind() == kind && r.name == name)
    }

    pub fn of_kind(&self, kind: ResourceType) -> impl Iterator<Item = &Resource> {
        self.resources.iter().filter(move |r| r.kind() == kind)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(flatten)]
    pub config: ResourceConfig,
}

impl Resource {
    pub fn new(name: impl Into<String>, config: ResourceConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn kind(&self) -> ResourceType {
        self.config.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum ResourceConfig {
    Bucket(BucketConfig),
    Topic(TopicConfig),
    Queue(QueueConfig),
    KeyValueStore(KeyValueStoreConfig),
    Secret(SecretConfig),
    Http(HttpConfig),
    Schedule(ScheduleConfig),
    Websocket(WebsocketConfig),
    Api(ApiConfig),
    Policy(PolicyConfig),
    Service(ServiceConfig),
}

impl ResourceConfig {
    pub fn kind(&self) -> ResourceType {
        match self {
            Self::Bucket(_) => ResourceType::Bucket,
            Self::Topic(_) => ResourceType::Topic,
            Self::Queue(_) => ResourceType::Queue,
            Self::KeyValueStore(_) => ResourceType::KeyValueStore,
            Self::Secret(_) => ResourceType::Secret,
            Self::Http(_) => ResourceType::Http,
            Self::Schedule(_) => ResourceType::Schedule,
            Self::Websocket(_) => ResourceType::Websocket,
            Self::Api(_) => ResourceType::Api,
            Self::Policy(_) => ResourceType::Policy,
            Self::Service(_) => ResourceType::Service,
        }
    }
}

/// Reference to the service that handles an event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceTarget {
    pub service: String,
}

impl ServiceTarget {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    #[serde(default)]
    pub listeners: Vec<BucketListener>,
}

/// Storage event notification delivered to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketListener {
    pub target: ServiceTarget,
    pub event_type: BlobEventType,
    #[serde(default)]
    pub key_prefix_filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default)]
    pub subscriptions: Vec<ServiceTarget>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStoreConfig {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretConfig {}

/// A service fronted by its own HTTP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    pub target: ServiceTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub target: ServiceTarget,
    pub cadence: ScheduleCadence,
}

/// Handlers for each websocket event; all three must be present to deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketConfig {
    pub connect_target: Option<ServiceTarget>,
    pub disconnect_target: Option<ServiceTarget>,
    pub message_target: Option<ServiceTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    pub openapi: OpenApiDocument,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub principals: Vec<ResourceIdentifier>,
    pub actions: Vec<Action>,
    pub resources: Vec<ResourceIdentifier>,
}

/// Execution unit for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub image: ImageReference,
    pub workers: usize,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub uri: String,
}
