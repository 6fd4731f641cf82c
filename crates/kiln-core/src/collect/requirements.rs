//! Per-service requirements recorded during a collection run.
//!
//! [`RequirementsRecorder`] is the live, lock-protected view the collection
//! server mutates; [`ServiceRequirements`] is the plain snapshot handed to the
//! spec synthesizer once the service has exited.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::rpc::messages::{
    ApiResource, BucketResource, DeclareRequest, HttpMethod, HttpProxyRegistration,
    KeyValueStoreResource, ListenerRegistration, PolicyResource, QueueResource, Registration,
    ResourceDeclaration, RouteRegistration, ScheduleRegistration, SecretResource,
    SecurityDefinition, SubscriptionRegistration, TopicResource, WebsocketEventType,
    WebsocketRegistration,
};
use crate::types::ResourceIdentifier;

/// Registration conflict detected within a single service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("route {method} {path} is already registered on API '{api}'")]
    DuplicateRoute {
        api: String,
        method: HttpMethod,
        path: String,
    },

    #[error("schedule '{name}' is already registered")]
    DuplicateSchedule { name: String },

    #[error("bucket '{bucket}' already has a storage listener")]
    DuplicateListener { bucket: String },

    #[error("websocket '{socket}' already has a {event} handler")]
    DuplicateWebsocketHandler {
        socket: String,
        event: WebsocketEventType,
    },

    #[error("an HTTP proxy cannot be registered alongside API routes")]
    ProxyWithRoutes,

    #[error("API routes cannot be registered alongside an HTTP proxy")]
    RoutesWithProxy,

    #[error("an HTTP proxy is already registered")]
    DuplicateProxy,
}

/// All registration conflicts recorded for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceErrors {
    pub service: String,
    pub errors: Vec<RegistrationError>,
}

impl fmt::Display for ServiceErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} has invalid requirements:", self.service)?;
        for err in &self.errors {
            write!(f, "\n  - {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServiceErrors {}

/// Everything one service declared and registered during collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRequirements {
    pub service_name: String,
    pub service_type: String,

    pub routes: BTreeMap<String, Vec<RouteRegistration>>,
    pub schedules: BTreeMap<String, ScheduleRegistration>,
    pub subscriptions: BTreeMap<String, Vec<SubscriptionRegistration>>,
    pub websockets: BTreeMap<String, Vec<WebsocketRegistration>>,
    pub listeners: BTreeMap<String, ListenerRegistration>,
    pub proxy: Option<HttpProxyRegistration>,

    pub buckets: BTreeMap<String, BucketResource>,
    pub key_value_stores: BTreeMap<String, KeyValueStoreResource>,
    pub topics: BTreeMap<String, TopicResource>,
    pub queues: BTreeMap<String, QueueResource>,
    pub secrets: BTreeMap<String, SecretResource>,
    pub apis: BTreeMap<String, ApiResource>,
    /// API name -> security definition name -> definition.
    pub api_security_definitions: BTreeMap<String, BTreeMap<String, SecurityDefinition>>,
    pub policies: BTreeMap<String, PolicyResource>,

    pub errors: Vec<RegistrationError>,
}

impl ServiceRequirements {
    pub fn new(service_name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_type: service_type.into(),
            ..Self::default()
        }
    }

    /// Registration conflicts, if any were recorded.
    pub fn check(&self) -> Result<(), ServiceErrors> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(ServiceErrors {
            service: self.service_name.clone(),
            errors: self.errors.clone(),
        })
    }

    /// Number of handlers the service runs concurrently.
    pub fn worker_count(&self) -> usize {
        let routes: usize = self.routes.values().map(Vec::len).sum();
        let subscriptions: usize = self.subscriptions.values().map(Vec::len).sum();
        let websockets: usize = self.websockets.values().map(Vec::len).sum();
        routes + self.listeners.len() + self.schedules.len() + subscriptions + websockets
    }

    fn declare(&mut self, request: DeclareRequest) {
        let DeclareRequest { name, resource } = request;
        match resource {
            ResourceDeclaration::Bucket(bucket) => {
                self.buckets.insert(name, bucket);
            }
            ResourceDeclaration::KeyValueStore(store) => {
                self.key_value_stores.insert(name, store);
            }
            ResourceDeclaration::Topic(topic) => {
                self.topics.insert(name, topic);
            }
            ResourceDeclaration::Queue(queue) => {
                self.queues.insert(name, queue);
            }
            ResourceDeclaration::Secret(secret) => {
                self.secrets.insert(name, secret);
            }
            ResourceDeclaration::Api(api) => {
                self.apis.insert(name, api);
            }
            ResourceDeclaration::ApiSecurityDefinition(def) => {
                self.api_security_definitions
                    .entry(def.api_name)
                    .or_default()
                    .insert(name, def.definition);
            }
            ResourceDeclaration::Policy(policy) => {
                let policy = self.with_default_principals(policy);
                let key = if name.is_empty() {
                    format!("{}-policy-{}", self.service_name, self.policies.len())
                } else {
                    name
                };
                self.policies.insert(key, policy);
            }
        }
    }

    /// Unset or unnamed principals default to the declaring service.
    fn with_default_principals(&self, mut policy: PolicyResource) -> PolicyResource {
        let this_service = ResourceIdentifier::service(&self.service_name);
        if policy.principals.is_empty() {
            policy.principals.push(this_service);
        } else {
            for principal in &mut policy.principals {
                if principal.name.is_empty() {
                    *principal = this_service.clone();
                }
            }
        }
        policy
    }

    fn register(&mut self, registration: Registration) {
        let outcome = match registration {
            Registration::Route(route) => self.register_route(route),
            Registration::Schedule(schedule) => self.register_schedule(schedule),
            Registration::Subscription(subscription) => {
                self.subscriptions
                    .entry(subscription.topic_name.clone())
                    .or_default()
                    .push(subscription);
                Ok(())
            }
            Registration::Listener(listener) => self.register_listener(listener),
            Registration::Websocket(handler) => self.register_websocket(handler),
            Registration::HttpProxy(proxy) => self.register_proxy(proxy),
        };
        if let Err(errors) = outcome {
            self.errors.extend(errors);
        }
    }

    fn register_route(&mut self, route: RouteRegistration) -> Result<(), Vec<RegistrationError>> {
        if self.proxy.is_some() {
            return Err(vec![RegistrationError::RoutesWithProxy]);
        }

        let existing = self.routes.entry(route.api.clone()).or_default();
        let conflicts: Vec<RegistrationError> = existing
            .iter()
            .filter(|other| other.path == route.path)
            .flat_map(|other| {
                other
                    .methods
                    .iter()
                    .filter(|method| route.methods.contains(method))
                    .map(|method| RegistrationError::DuplicateRoute {
                        api: route.api.clone(),
                        method: *method,
                        path: route.path.clone(),
                    })
            })
            .collect();

        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        existing.push(route);
        Ok(())
    }

    fn register_schedule(
        &mut self,
        schedule: ScheduleRegistration,
    ) -> Result<(), Vec<RegistrationError>> {
        if self.schedules.contains_key(&schedule.schedule_name) {
            return Err(vec![RegistrationError::DuplicateSchedule {
                name: schedule.schedule_name,
            }]);
        }
        self.schedules
            .insert(schedule.schedule_name.clone(), schedule);
        Ok(())
    }

    fn register_listener(
        &mut self,
        listener: ListenerRegistration,
    ) -> Result<(), Vec<RegistrationError>> {
        if self.listeners.contains_key(&listener.bucket_name) {
            return Err(vec![RegistrationError::DuplicateListener {
                bucket: listener.bucket_name,
            }]);
        }
        self.listeners
            .insert(listener.bucket_name.clone(), listener);
        Ok(())
    }

    fn register_websocket(
        &mut self,
        handler: WebsocketRegistration,
    ) -> Result<(), Vec<RegistrationError>> {
        let handlers = self
            .websockets
            .entry(handler.socket_name.clone())
            .or_default();
        if handlers.iter().any(|h| h.event_type == handler.event_type) {
            return Err(vec![RegistrationError::DuplicateWebsocketHandler {
                socket: handler.socket_name,
                event: handler.event_type,
            }]);
        }
        handlers.push(handler);
        Ok(())
    }

    fn register_proxy(
        &mut self,
        proxy: HttpProxyRegistration,
    ) -> Result<(), Vec<RegistrationError>> {
        if self.routes.values().any(|routes| !routes.is_empty()) {
            return Err(vec![RegistrationError::ProxyWithRoutes]);
        }
        if self.proxy.is_some() {
            return Err(vec![RegistrationError::DuplicateProxy]);
        }
        self.proxy = Some(proxy);
        Ok(())
    }
}

/// Lock-protected requirements for a service under collection.
///
/// All mutation goes through one mutex, so registration order decides which
/// of two conflicting registrations is the existing one.
#[derive(Debug)]
pub struct RequirementsRecorder {
    state: Mutex<ServiceRequirements>,
}

impl RequirementsRecorder {
    pub fn new(service_name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(ServiceRequirements::new(service_name, service_type)),
        }
    }

    pub fn service_name(&self) -> String {
        self.lock().service_name.clone()
    }

    /// Store or overwrite a declared resource.
    pub fn declare(&self, request: DeclareRequest) {
        self.lock().declare(request);
    }

    /// Validate and record a registration. Conflicts are kept as errors.
    pub fn register(&self, registration: Registration) {
        self.lock().register(registration);
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ServiceRequirements {
        self.lock().clone()
    }

    pub fn into_requirements(self) -> ServiceRequirements {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, ServiceRequirements> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
