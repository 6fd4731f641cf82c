//! Message types carried over the resource collection channel.
//!
//! Three families of messages exist:
//! - resource declarations (`DeclareRequest`), answered with an ack
//! - registration streams (`StreamKind` + `StreamMessage`), answered with a
//!   registration response
//! - data-plane calls (publish, storage, queue), which are always rejected
//!   while a service is under collection

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Action, ResourceIdentifier};

// =============================================================================
// Resource declarations
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketResource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicResource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueResource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStoreResource {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretResource {}

/// API declaration. `security` maps a security definition name to the scopes
/// required on every route of the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResource {
    #[serde(default)]
    pub security: BTreeMap<String, Vec<String>>,
}

/// Security scheme attached to an API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityDefinition {
    /// OpenID Connect issuer with accepted audiences.
    Oidc {
        issuer: String,
        #[serde(default)]
        audiences: Vec<String>,
    },
    /// Any scheme kind this tool does not understand.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSecurityDefinitionResource {
    pub api_name: String,
    pub definition: SecurityDefinition,
}

/// Access policy: principals may perform actions on resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResource {
    #[serde(default)]
    pub principals: Vec<ResourceIdentifier>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub resources: Vec<ResourceIdentifier>,
}

/// Payload of a declare call, tagged by resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "config", rename_all = "snake_case")]
pub enum ResourceDeclaration {
    Bucket(BucketResource),
    KeyValueStore(KeyValueStoreResource),
    Topic(TopicResource),
    Queue(QueueResource),
    Secret(SecretResource),
    Api(ApiResource),
    ApiSecurityDefinition(ApiSecurityDefinitionResource),
    Policy(PolicyResource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareRequest {
    #[serde(default)]
    pub name: String,
    pub resource: ResourceDeclaration,
}

impl DeclareRequest {
    pub fn new(name: impl Into<String>, resource: ResourceDeclaration) -> Self {
        Self {
            name: name.into(),
            resource,
        }
    }
}

// =============================================================================
// Registrations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-route security overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOptions {
    /// Opt this route out of the API's security requirements.
    #[serde(default)]
    pub security_disabled: bool,
    /// Replace the API's security requirements for this route.
    #[serde(default)]
    pub security: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRegistration {
    pub api: String,
    pub path: String,
    pub methods: Vec<HttpMethod>,
    #[serde(default)]
    pub options: RouteOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleCadence {
    /// Rate expression such as `5 minutes`.
    Every { rate: String },
    /// Cron expression.
    Cron { expression: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRegistration {
    pub schedule_name: String,
    pub cadence: ScheduleCadence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRegistration {
    pub topic_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEventType {
    Created,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerRegistration {
    pub bucket_name: String,
    pub event_type: BlobEventType,
    #[serde(default)]
    pub key_prefix_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebsocketEventType {
    Connect,
    Disconnect,
    Message,
}

impl WebsocketEventType {
    pub const ALL: [Self; 3] = [Self::Connect, Self::Disconnect, Self::Message];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for WebsocketEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebsocketRegistration {
    pub socket_name: String,
    pub event_type: WebsocketEventType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpProxyRegistration {
    /// Address the service's own HTTP server listens on.
    pub host: String,
}

/// Which registration stream a connection opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Api,
    Schedule,
    Subscription,
    StorageListener,
    Websocket,
    HttpProxy,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Api => "api",
            Self::Schedule => "schedule",
            Self::Subscription => "subscription",
            Self::StorageListener => "storage_listener",
            Self::Websocket => "websocket",
            Self::HttpProxy => "http_proxy",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Route(RouteRegistration),
    Schedule(ScheduleRegistration),
    Subscription(SubscriptionRegistration),
    Listener(ListenerRegistration),
    Websocket(WebsocketRegistration),
    HttpProxy(HttpProxyRegistration),
}

impl Registration {
    /// The stream kind this registration belongs to.
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            Self::Route(_) => StreamKind::Api,
            Self::Schedule(_) => StreamKind::Schedule,
            Self::Subscription(_) => StreamKind::Subscription,
            Self::Listener(_) => StreamKind::StorageListener,
            Self::Websocket(_) => StreamKind::Websocket,
            Self::HttpProxy(_) => StreamKind::HttpProxy,
        }
    }
}

/// Client-to-server message on an open registration stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMessage {
    RegistrationRequest(Registration),
    /// Response to a delivered event. Never expected during collection.
    EventResponse(Value),
}

// =============================================================================
// Data plane
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic_name: String,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRequest {
    pub bucket_name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobWriteRequest {
    pub bucket_name: String,
    pub key: String,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListBlobsRequest {
    pub bucket_name: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreSignRequest {
    pub bucket_name: String,
    pub key: String,
    #[serde(default)]
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSendRequest {
    pub queue_name: String,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReceiveRequest {
    pub queue_name: String,
    #[serde(default)]
    pub depth: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCompleteRequest {
    pub queue_name: String,
    pub lease_id: String,
}

// =============================================================================
// Calls
// =============================================================================

/// First line of every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", content = "request", rename_all = "snake_case")]
pub enum Call {
    Declare(DeclareRequest),
    Serve(StreamKind),
    TopicPublish(PublishRequest),
    StorageRead(BlobRequest),
    StorageWrite(BlobWriteRequest),
    StorageDelete(BlobRequest),
    StorageList(ListBlobsRequest),
    StorageExists(BlobRequest),
    StoragePreSign(PreSignRequest),
    QueueSend(QueueSendRequest),
    QueueReceive(QueueReceiveRequest),
    QueueComplete(QueueCompleteRequest),
}

impl Call {
    /// Name of the data-plane operation, or `None` for declare/serve calls.
    pub fn data_plane_operation(&self) -> Option<&'static str> {
        match self {
            Self::Declare(_) | Self::Serve(_) => None,
            Self::TopicPublish(_) => Some("Topic::Publish"),
            Self::StorageRead(_) => Some("Storage::Read"),
            Self::StorageWrite(_) => Some("Storage::Write"),
            Self::StorageDelete(_) => Some("Storage::Delete"),
            Self::StorageList(_) => Some("Storage::ListBlobs"),
            Self::StorageExists(_) => Some("Storage::Exists"),
            Self::StoragePreSign(_) => Some("Storage::PreSignUrl"),
            Self::QueueSend(_) => Some("Queue::Send"),
            Self::QueueReceive(_) => Some("Queue::Receive"),
            Self::QueueComplete(_) => Some("Queue::Complete"),
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    InvalidArgument,
    FailedPrecondition,
    Internal,
}

/// Error status carried in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ack,
    RegistrationResponse,
    Error(Status),
}
