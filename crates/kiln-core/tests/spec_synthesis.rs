//! Tests for merging service requirements into a deployment spec.

use std::collections::BTreeMap;

use kiln_core::collect::{RegistrationError, ServiceRequirements};
use kiln_core::rpc::messages::{
    ApiResource, BlobEventType, BucketResource, HttpMethod, ListenerRegistration, PolicyResource,
    RouteOptions, RouteRegistration, ScheduleCadence, ScheduleRegistration, SecurityDefinition,
    SubscriptionRegistration, TopicResource, WebsocketEventType, WebsocketRegistration,
};
use kiln_core::spec::{
    ProjectError, Resource, ResourceConfig, ServiceTarget, SynthesisError, synthesize,
};
use kiln_core::types::{Action, ResourceIdentifier, ResourceType};

fn service(name: &str) -> ServiceRequirements {
    ServiceRequirements::new(name, "default")
}

fn add_route(req: &mut ServiceRequirements, api: &str, path: &str, methods: &[HttpMethod]) {
    req.routes
        .entry(api.to_string())
        .or_default()
        .push(RouteRegistration {
            api: api.to_string(),
            path: path.to_string(),
            methods: methods.to_vec(),
            options: RouteOptions::default(),
        });
}

fn add_websocket(req: &mut ServiceRequirements, socket: &str, event: WebsocketEventType) {
    req.websockets
        .entry(socket.to_string())
        .or_default()
        .push(WebsocketRegistration {
            socket_name: socket.to_string(),
            event_type: event,
        });
}

fn env() -> BTreeMap<String, String> {
    BTreeMap::from([("LOG_LEVEL".to_string(), "debug".to_string())])
}

fn find<'a>(resources: &'a [Resource], kind: ResourceType, name: &str) -> &'a Resource {
    resources
        .iter()
        .find(|r| r.kind() == kind && r.name == name)
        .unwrap_or_else(|| panic!("missing {kind} {name}"))
}

#[test]
fn subscribed_topic_targets_only_subscribers() {
    let mut a = service("svc-a");
    a.topics.insert("orders".to_string(), TopicResource {});
    a.subscriptions.insert(
        "orders".to_string(),
        vec![SubscriptionRegistration {
            topic_name: "orders".to_string(),
        }],
    );
    let mut b = service("svc-b");
    b.topics.insert("orders".to_string(), TopicResource {});

    let synthesis = synthesize(&[a, b], &env()).unwrap();
    assert!(synthesis.is_deployable());

    let topics: Vec<&Resource> = synthesis.spec.of_kind(ResourceType::Topic).collect();
    assert_eq!(topics.len(), 1);
    match &topics[0].config {
        ResourceConfig::Topic(config) => {
            assert_eq!(config.subscriptions, vec![ServiceTarget::new("svc-a")]);
        }
        other => panic!("unexpected config: {other:?}"),
    }
}

#[test]
fn bucket_listeners_from_every_service_are_targets() {
    let services: Vec<ServiceRequirements> = ["svc-a", "svc-b", "svc-c"]
        .into_iter()
        .map(|name| {
            let mut req = service(name);
            req.buckets.insert("uploads".to_string(), BucketResource {});
            req.listeners.insert(
                "uploads".to_string(),
                ListenerRegistration {
                    bucket_name: "uploads".to_string(),
                    event_type: BlobEventType::Created,
                    key_prefix_filter: String::new(),
                },
            );
            req
        })
        .collect();

    let synthesis = synthesize(&services, &env()).unwrap();
    let bucket = find(&synthesis.spec.resources, ResourceType::Bucket, "uploads");
    match &bucket.config {
        ResourceConfig::Bucket(config) => {
            let targets: Vec<&str> = config
                .listeners
                .iter()
                .map(|l| l.target.service.as_str())
                .collect();
            assert_eq!(targets, vec!["svc-a", "svc-b", "svc-c"]);
        }
        other => panic!("unexpected config: {other:?}"),
    }
}

#[test]
fn overlapping_routes_keep_the_first_service() {
    let mut a = service("svc-a");
    add_route(&mut a, "public", "/orders/:id", &[HttpMethod::Get, HttpMethod::Put]);
    let mut b = service("svc-b");
    add_route(
        &mut b,
        "public",
        "/orders/:id",
        &[HttpMethod::Get, HttpMethod::Put, HttpMethod::Delete],
    );

    let synthesis = synthesize(&[a, b], &env()).unwrap();
    assert_eq!(synthesis.errors.len(), 2);
    assert!(synthesis.errors.errors().iter().all(|err| matches!(
        err,
        ProjectError::OverlappingRoute { service, existing, .. }
            if service == "svc-b" && existing == "svc-a"
    )));
    assert!(synthesis.errors.to_string().contains("svc-a"));

    let api = find(&synthesis.spec.resources, ResourceType::Api, "public");
    let ResourceConfig::Api(config) = &api.config else {
        panic!("expected an API");
    };
    let doc = &config.openapi;
    let get = doc.operation("/orders/{id}", HttpMethod::Get).unwrap();
    assert_eq!(get.target, ServiceTarget::new("svc-a"));
    let delete = doc.operation("/orders/{id}", HttpMethod::Delete).unwrap();
    assert_eq!(delete.target, ServiceTarget::new("svc-b"));

    let params = &doc.paths["/orders/{id}"].parameters;
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].name, "id");
    assert!(params[0].required);

    assert!(synthesis.into_result().is_err());
}

#[test]
fn api_security_is_attached_from_definitions() {
    let mut a = service("svc-a");
    a.apis.insert(
        "public".to_string(),
        ApiResource {
            security: BTreeMap::from([("user".to_string(), vec!["orders:read".to_string()])]),
        },
    );
    a.api_security_definitions.insert(
        "public".to_string(),
        BTreeMap::from([(
            "user".to_string(),
            SecurityDefinition::Oidc {
                issuer: "https://auth.example.com".to_string(),
                audiences: vec!["shop".to_string()],
            },
        )]),
    );
    a.routes.insert(
        "public".to_string(),
        vec![RouteRegistration {
            api: "public".to_string(),
            path: "/health".to_string(),
            methods: vec![HttpMethod::Get],
            options: RouteOptions {
                security_disabled: true,
                security: BTreeMap::new(),
            },
        }],
    );

    let synthesis = synthesize(&[a], &env()).unwrap();
    assert!(synthesis.is_deployable());
    let api = find(&synthesis.spec.resources, ResourceType::Api, "public");
    let ResourceConfig::Api(config) = &api.config else {
        panic!("expected an API");
    };
    let doc = &config.openapi;
    assert_eq!(doc.security.len(), 1);
    assert_eq!(doc.security[0]["user"], vec!["orders:read"]);
    assert_eq!(
        doc.components.security_schemes["user"].open_id_connect_url,
        "https://auth.example.com/.well-known/openid-configuration"
    );
    let health = doc.operation("/health", HttpMethod::Get).unwrap();
    assert_eq!(health.security, Some(vec![]));
}

#[test]
fn unsupported_security_scheme_is_a_project_error() {
    let mut a = service("svc-a");
    a.apis.insert("public".to_string(), ApiResource::default());
    a.api_security_definitions.insert(
        "public".to_string(),
        BTreeMap::from([("basic".to_string(), SecurityDefinition::Unsupported)]),
    );

    let synthesis = synthesize(&[a], &env()).unwrap();
    assert_eq!(
        synthesis.errors.errors(),
        &[ProjectError::UnsupportedSecurityScheme {
            api: "public".to_string(),
            name: "basic".to_string(),
        }]
    );
}

#[test]
fn incomplete_websocket_names_missing_handlers() {
    let mut a = service("svc-a");
    add_websocket(&mut a, "chat", WebsocketEventType::Connect);

    let synthesis = synthesize(&[a], &env()).unwrap();
    assert_eq!(
        synthesis.errors.errors(),
        &[ProjectError::IncompleteWebsocket {
            socket: "chat".to_string(),
            missing: vec![WebsocketEventType::Disconnect, WebsocketEventType::Message],
        }]
    );
}

#[test]
fn websocket_handlers_may_span_services() {
    let mut a = service("svc-a");
    add_websocket(&mut a, "chat", WebsocketEventType::Connect);
    add_websocket(&mut a, "chat", WebsocketEventType::Disconnect);
    let mut b = service("svc-b");
    add_websocket(&mut b, "chat", WebsocketEventType::Message);

    let synthesis = synthesize(&[a, b], &env()).unwrap();
    assert!(synthesis.is_deployable());
    let socket = find(&synthesis.spec.resources, ResourceType::Websocket, "chat");
    let ResourceConfig::Websocket(config) = &socket.config else {
        panic!("expected a websocket");
    };
    assert_eq!(config.message_target, Some(ServiceTarget::new("svc-b")));
}

#[test]
fn duplicate_schedule_across_services_keeps_the_first() {
    let schedule = |name: &str| ScheduleRegistration {
        schedule_name: name.to_string(),
        cadence: ScheduleCadence::Every {
            rate: "5 minutes".to_string(),
        },
    };
    let mut a = service("svc-a");
    a.schedules.insert("tick".to_string(), schedule("tick"));
    let mut b = service("svc-b");
    b.schedules.insert("tick".to_string(), schedule("tick"));

    let synthesis = synthesize(&[a, b], &env()).unwrap();
    assert_eq!(synthesis.errors.len(), 1);
    let tick = find(&synthesis.spec.resources, ResourceType::Schedule, "tick");
    let ResourceConfig::Schedule(config) = &tick.config else {
        panic!("expected a schedule");
    };
    assert_eq!(config.target, ServiceTarget::new("svc-a"));
}

#[test]
fn service_registration_errors_abort_synthesis() {
    let mut a = service("svc-a");
    a.errors.push(RegistrationError::DuplicateListener {
        bucket: "uploads".to_string(),
    });

    let err = synthesize(&[a], &env()).unwrap_err();
    assert!(matches!(err, SynthesisError::InvalidRequirements(ref e) if e.len() == 1));
    assert!(err.to_string().contains("svc-a"));
}

#[test]
fn policies_are_compacted_and_named_by_content() {
    let policy = |bucket: &str| PolicyResource {
        principals: vec![ResourceIdentifier::service("svc-a")],
        actions: vec![Action::BucketFileGet, Action::BucketFileList],
        resources: vec![ResourceIdentifier::new(bucket, ResourceType::Bucket)],
    };

    let mut forward = service("svc-a");
    forward.policies.insert("p1".to_string(), policy("images"));
    forward.policies.insert("p2".to_string(), policy("thumbs"));

    let mut backward = service("svc-a");
    backward.policies.insert("p1".to_string(), policy("thumbs"));
    backward.policies.insert("p2".to_string(), policy("images"));

    let first = synthesize(&[forward], &env()).unwrap().spec;
    let second = synthesize(&[backward], &env()).unwrap().spec;

    let policies: Vec<&Resource> = first.of_kind(ResourceType::Policy).collect();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].name.len(), 32);
    let ResourceConfig::Policy(config) = &policies[0].config else {
        panic!("expected a policy");
    };
    let resources: Vec<&str> = config.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(resources, vec!["images", "thumbs"]);

    assert_eq!(
        first.find(ResourceType::Policy, &policies[0].name),
        second.find(ResourceType::Policy, &policies[0].name)
    );
}

#[test]
fn identical_policies_across_services_are_deduplicated() {
    let shared = PolicyResource {
        principals: vec![ResourceIdentifier::service("svc-worker")],
        actions: vec![Action::QueueDequeue],
        resources: vec![ResourceIdentifier::new("jobs", ResourceType::Queue)],
    };
    let mut a = service("svc-a");
    a.policies.insert("grant".to_string(), shared.clone());
    let mut b = service("svc-b");
    b.policies.insert("grant".to_string(), shared);

    let spec = synthesize(&[a, b], &env()).unwrap().spec;
    assert_eq!(spec.of_kind(ResourceType::Policy).count(), 1);
}

#[test]
fn services_carry_workers_type_and_env() {
    let mut a = ServiceRequirements::new("svc-a", "batch");
    add_route(&mut a, "public", "/", &[HttpMethod::Get]);
    add_route(&mut a, "public", "/orders", &[HttpMethod::Post]);
    a.subscriptions.insert(
        "orders".to_string(),
        vec![
            SubscriptionRegistration {
                topic_name: "orders".to_string(),
            },
            SubscriptionRegistration {
                topic_name: "orders".to_string(),
            },
        ],
    );

    let spec = synthesize(&[a], &env()).unwrap().spec;
    let unit = find(&spec.resources, ResourceType::Service, "svc-a");
    let ResourceConfig::Service(config) = &unit.config else {
        panic!("expected a service");
    };
    assert_eq!(config.workers, 4);
    assert_eq!(config.service_type, "batch");
    assert_eq!(config.image.uri, "svc-a");
    assert_eq!(config.env["LOG_LEVEL"], "debug");
}

#[test]
fn synthesis_is_deterministic() {
    let build = || {
        let mut a = service("svc-a");
        a.topics.insert("orders".to_string(), TopicResource {});
        a.buckets.insert("uploads".to_string(), BucketResource {});
        add_route(&mut a, "public", "/orders/:id", &[HttpMethod::Get]);
        add_websocket(&mut a, "chat", WebsocketEventType::Message);
        a.policies.insert(
            "p".to_string(),
            PolicyResource {
                principals: vec![ResourceIdentifier::service("svc-a")],
                actions: vec![Action::TopicPublish],
                resources: vec![ResourceIdentifier::new("orders", ResourceType::Topic)],
            },
        );
        let mut b = service("svc-b");
        b.secrets.insert("api-key".to_string(), Default::default());
        vec![a, b]
    };

    let first = synthesize(&build(), &env()).unwrap().spec.to_json_pretty().unwrap();
    let second = synthesize(&build(), &env()).unwrap().spec.to_json_pretty().unwrap();
    assert_eq!(first, second);

    let spec = synthesize(&build(), &env()).unwrap().spec;
    let kinds: Vec<ResourceType> = spec.resources.iter().map(Resource::kind).collect();
    assert_eq!(
        kinds,
        vec![
            ResourceType::Bucket,
            ResourceType::Topic,
            ResourceType::Secret,
            ResourceType::Websocket,
            ResourceType::Api,
            ResourceType::Policy,
            ResourceType::Service,
            ResourceType::Service,
        ]
    );
}
