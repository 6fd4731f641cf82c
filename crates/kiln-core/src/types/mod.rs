//! Shared core types used across the collection protocol and the deployment spec.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of infrastructure resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Api,
    ApiSecurityDefinition,
    Bucket,
    Topic,
    Queue,
    KeyValueStore,
    Secret,
    Policy,
    Schedule,
    Websocket,
    Http,
    /// An execution unit (one deployed service).
    Service,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::ApiSecurityDefinition => "api_security_definition",
            Self::Bucket => "bucket",
            Self::Topic => "topic",
            Self::Queue => "queue",
            Self::KeyValueStore => "key_value_store",
            Self::Secret => "secret",
            Self::Policy => "policy",
            Self::Schedule => "schedule",
            Self::Websocket => "websocket",
            Self::Http => "http",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name + kind pair identifying a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ResourceType,
}

impl ResourceIdentifier {
    pub fn new(name: impl Into<String>, kind: ResourceType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::new(name, ResourceType::Service)
    }
}

/// Capability verbs a policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    BucketFileList,
    BucketFileGet,
    BucketFilePut,
    BucketFileDelete,
    TopicPublish,
    QueueEnqueue,
    QueueDequeue,
    KeyValueStoreRead,
    KeyValueStoreWrite,
    KeyValueStoreDelete,
    SecretPut,
    SecretAccess,
    WebsocketManage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BucketFileList => "bucket_file_list",
            Self::BucketFileGet => "bucket_file_get",
            Self::BucketFilePut => "bucket_file_put",
            Self::BucketFileDelete => "bucket_file_delete",
            Self::TopicPublish => "topic_publish",
            Self::QueueEnqueue => "queue_enqueue",
            Self::QueueDequeue => "queue_dequeue",
            Self::KeyValueStoreRead => "key_value_store_read",
            Self::KeyValueStoreWrite => "key_value_store_write",
            Self::KeyValueStoreDelete => "key_value_store_delete",
            Self::SecretPut => "secret_put",
            Self::SecretAccess => "secret_access",
            Self::WebsocketManage => "websocket_manage",
        }
    }
}

/// Environment stage communicated to a running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Collection mode: the service only declares its requirements.
    Build,
    /// Local run against the emulation layer.
    Run,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Run => "run",
        }
    }
}

/// Environment variable carrying the RPC endpoint address.
pub const SERVICE_ADDRESS_ENV: &str = "SERVICE_ADDRESS";
/// Environment variable carrying the stage name.
pub const ENVIRONMENT_ENV: &str = "KILN_ENVIRONMENT";
/// Host name containers use to reach the host machine.
pub const CONTAINER_HOST: &str = "host.docker.internal";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_identifier_uses_type_key() {
        let id = ResourceIdentifier::new("uploads", ResourceType::Bucket);
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["name"], "uploads");
        assert_eq!(json["type"], "bucket");
    }

    #[test]
    fn action_names_match_serde() {
        let json = serde_json::to_value(Action::TopicPublish).unwrap();
        assert_eq!(json, Action::TopicPublish.as_str());
    }
}
