//! Merge per-service requirements into one deployment spec.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::errors::{ProjectError, ProjectErrors, SynthesisError};
use super::openapi::ApiBuilder;
use super::policy::{compact, policy_name};
use super::{
    ApiConfig, BucketConfig, BucketListener, DeploymentSpec, HttpConfig, ImageReference,
    KeyValueStoreConfig, PolicyConfig, QueueConfig, Resource, ResourceConfig, ScheduleConfig,
    SecretConfig, ServiceConfig, ServiceTarget, TopicConfig, WebsocketConfig,
};
use crate::collect::{ServiceErrors, ServiceRequirements};
use crate::rpc::messages::WebsocketEventType;

/// Synthesized spec together with any project-level violations.
///
/// The spec is complete even when `errors` is non-empty, so it can still be
/// shown; it should not be deployed unless `errors` is empty.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub spec: DeploymentSpec,
    pub errors: ProjectErrors,
}

impl Synthesis {
    pub fn is_deployable(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<DeploymentSpec, ProjectErrors> {
        self.errors.into_result()?;
        Ok(self.spec)
    }
}

/// Build the deployment spec for `requirements`.
///
/// Fails outright if any service recorded registration conflicts during
/// collection. Cross-service violations are returned in [`Synthesis::errors`].
pub fn synthesize(
    requirements: &[ServiceRequirements],
    env: &BTreeMap<String, String>,
) -> Result<Synthesis, SynthesisError> {
    let invalid: Vec<ServiceErrors> = requirements
        .iter()
        .filter_map(|r| r.check().err())
        .collect();
    if !invalid.is_empty() {
        return Err(SynthesisError::InvalidRequirements(invalid));
    }

    let mut errors = ProjectErrors::new();
    let mut resources = Vec::new();

    resources.extend(buckets(requirements));
    resources.extend(topics(requirements));
    resources.extend(simple(requirements, |r| r.queues.keys(), || {
        ResourceConfig::Queue(QueueConfig::default())
    }));
    resources.extend(simple(requirements, |r| r.key_value_stores.keys(), || {
        ResourceConfig::KeyValueStore(KeyValueStoreConfig::default())
    }));
    resources.extend(simple(requirements, |r| r.secrets.keys(), || {
        ResourceConfig::Secret(SecretConfig::default())
    }));
    resources.extend(http_proxies(requirements));
    resources.extend(schedules(requirements, &mut errors));
    resources.extend(websockets(requirements, &mut errors));
    resources.extend(apis(requirements, &mut errors));
    resources.extend(policies(requirements)?);
    resources.extend(services(requirements, env));

    info!(
        resources = resources.len(),
        errors = errors.len(),
        "Synthesized deployment spec"
    );

    Ok(Synthesis {
        spec: DeploymentSpec { resources },
        errors,
    })
}

fn buckets(requirements: &[ServiceRequirements]) -> Vec<Resource> {
    let mut buckets: BTreeMap<String, BucketConfig> = BTreeMap::new();
    for req in requirements {
        for name in req.buckets.keys() {
            buckets.entry(name.clone()).or_default();
        }
        for (bucket, listener) in &req.listeners {
            buckets
                .entry(bucket.clone())
                .or_default()
                .listeners
                .push(BucketListener {
                    target: ServiceTarget::new(&req.service_name),
                    event_type: listener.event_type,
                    key_prefix_filter: listener.key_prefix_filter.clone(),
                });
        }
    }
    buckets
        .into_iter()
        .map(|(name, config)| Resource::new(name, ResourceConfig::Bucket(config)))
        .collect()
}

fn topics(requirements: &[ServiceRequirements]) -> Vec<Resource> {
    let mut topics: BTreeMap<String, TopicConfig> = BTreeMap::new();
    for req in requirements {
        for name in req.topics.keys() {
            topics.entry(name.clone()).or_default();
        }
        for (topic, subscriptions) in &req.subscriptions {
            let config = topics.entry(topic.clone()).or_default();
            if !subscriptions.is_empty() {
                config
                    .subscriptions
                    .push(ServiceTarget::new(&req.service_name));
            }
        }
    }
    topics
        .into_iter()
        .map(|(name, config)| Resource::new(name, ResourceConfig::Topic(config)))
        .collect()
}

/// Union by name of a configuration-free resource kind.
fn simple<'a, I>(
    requirements: &'a [ServiceRequirements],
    names: impl Fn(&'a ServiceRequirements) -> I,
    config: impl Fn() -> ResourceConfig,
) -> Vec<Resource>
where
    I: Iterator<Item = &'a String>,
{
    let names: BTreeSet<&String> = requirements.iter().flat_map(names).collect();
    names
        .into_iter()
        .map(|name| Resource::new(name.clone(), config()))
        .collect()
}

fn http_proxies(requirements: &[ServiceRequirements]) -> Vec<Resource> {
    let mut proxies: Vec<Resource> = requirements
        .iter()
        .filter(|req| req.proxy.is_some())
        .map(|req| {
            Resource::new(
                req.service_name.clone(),
                ResourceConfig::Http(HttpConfig {
                    target: ServiceTarget::new(&req.service_name),
                }),
            )
        })
        .collect();
    proxies.sort_by(|a, b| a.name.cmp(&b.name));
    proxies
}

fn schedules(requirements: &[ServiceRequirements], errors: &mut ProjectErrors) -> Vec<Resource> {
    let mut schedules: BTreeMap<String, ScheduleConfig> = BTreeMap::new();
    for req in requirements {
        for (name, schedule) in &req.schedules {
            if let Some(existing) = schedules.get(name) {
                errors.push(ProjectError::DuplicateSchedule {
                    name: name.clone(),
                    service: req.service_name.clone(),
                    existing: existing.target.service.clone(),
                });
                continue;
            }
            schedules.insert(
                name.clone(),
                ScheduleConfig {
                    target: ServiceTarget::new(&req.service_name),
                    cadence: schedule.cadence.clone(),
                },
            );
        }
    }
    schedules
        .into_iter()
        .map(|(name, config)| Resource::new(name, ResourceConfig::Schedule(config)))
        .collect()
}

fn websockets(requirements: &[ServiceRequirements], errors: &mut ProjectErrors) -> Vec<Resource> {
    let mut sockets: BTreeMap<String, WebsocketConfig> = BTreeMap::new();
    for req in requirements {
        for (socket, handlers) in &req.websockets {
            let config = sockets.entry(socket.clone()).or_default();
            for handler in handlers {
                let slot = match handler.event_type {
                    WebsocketEventType::Connect => &mut config.connect_target,
                    WebsocketEventType::Disconnect => &mut config.disconnect_target,
                    WebsocketEventType::Message => &mut config.message_target,
                };
                match slot.as_ref() {
                    Some(existing) => errors.push(ProjectError::DuplicateWebsocketHandler {
                        socket: socket.clone(),
                        event: handler.event_type,
                        service: req.service_name.clone(),
                        existing: existing.service.clone(),
                    }),
                    None => *slot = Some(ServiceTarget::new(&req.service_name)),
                }
            }
        }
    }

    for (socket, config) in &sockets {
        let missing: Vec<WebsocketEventType> = WebsocketEventType::ALL
            .into_iter()
            .filter(|event| match event {
                WebsocketEventType::Connect => config.connect_target.is_none(),
                WebsocketEventType::Disconnect => config.disconnect_target.is_none(),
                WebsocketEventType::Message => config.message_target.is_none(),
            })
            .collect();
        if !missing.is_empty() {
            errors.push(ProjectError::IncompleteWebsocket {
                socket: socket.clone(),
                missing,
            });
        }
    }

    sockets
        .into_iter()
        .map(|(name, config)| Resource::new(name, ResourceConfig::Websocket(config)))
        .collect()
}

fn apis(requirements: &[ServiceRequirements], errors: &mut ProjectErrors) -> Vec<Resource> {
    let names: BTreeSet<&String> = requirements
        .iter()
        .flat_map(|req| req.apis.keys().chain(req.routes.keys()))
        .collect();

    let mut resources = Vec::new();
    for name in names {
        let mut builder = ApiBuilder::new(name.clone());
        for req in requirements {
            if let Some(api) = req.apis.get(name) {
                builder.add_api_security(&api.security);
            }
            if let Some(definitions) = req.api_security_definitions.get(name) {
                for (scheme, definition) in definitions {
                    if let Err(err) = builder.add_security_definition(scheme, definition) {
                        errors.push(err);
                    }
                }
            }
            for route in req.routes.get(name).into_iter().flatten() {
                for err in builder.add_route(&req.service_name, route) {
                    errors.push(err);
                }
            }
        }
        debug!(api = %name, "Built API document");
        resources.push(Resource::new(
            name.clone(),
            ResourceConfig::Api(ApiConfig {
                openapi: builder.finish(),
            }),
        ));
    }
    resources
}

fn policies(requirements: &[ServiceRequirements]) -> Result<Vec<Resource>, SynthesisError> {
    let mut named: BTreeMap<String, PolicyConfig> = BTreeMap::new();
    for req in requirements {
        for policy in compact(req.policies.values()) {
            let name = policy_name(&policy)?;
            named.entry(name).or_insert(policy);
        }
    }
    Ok(named
        .into_iter()
        .map(|(name, config)| Resource::new(name, ResourceConfig::Policy(config)))
        .collect())
}

fn services(requirements: &[ServiceRequirements], env: &BTreeMap<String, String>) -> Vec<Resource> {
    let mut services: Vec<Resource> = requirements
        .iter()
        .map(|req| {
            Resource::new(
                req.service_name.clone(),
                ResourceConfig::Service(ServiceConfig {
                    image: ImageReference {
                        uri: req.service_name.clone(),
                    },
                    workers: req.worker_count(),
                    service_type: req.service_type.clone(),
                    env: env.clone(),
                }),
            )
        })
        .collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    services
}
