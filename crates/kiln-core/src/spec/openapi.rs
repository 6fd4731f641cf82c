//! OpenAPI documents for declared APIs.
//!
//! Only the subset needed to describe routes, their target services, path
//! parameters, and OpenID Connect security is modelled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::ServiceTarget;
use super::errors::ProjectError;
use crate::rpc::messages::{HttpMethod, RouteOptions, RouteRegistration, SecurityDefinition};

pub const OPENAPI_VERSION: &str = "3.0.1";
pub const API_VERSION: &str = "v1";

const OIDC_DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Scheme name -> required scopes.
pub type SecurityRequirement = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenApiDocument {
    pub openapi: String,
    pub info: Info,
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
    #[serde(default, skip_serializing_if = "Components::is_empty")]
    pub components: Components,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security: Vec<SecurityRequirement>,
}

impl OpenApiDocument {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            openapi: OPENAPI_VERSION.to_string(),
            info: Info {
                title: title.into(),
                version: API_VERSION.to_string(),
            },
            paths: BTreeMap::new(),
            components: Components::default(),
            security: Vec::new(),
        }
    }

    pub fn operation(&self, path: &str, method: HttpMethod) -> Option<&Operation> {
        self.paths
            .get(path)?
            .operations
            .get(&method.as_str().to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub title: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathItem {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    /// Lower-case method -> operation
    #[serde(flatten)]
    pub operations: BTreeMap<String, Operation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: String,
    pub required: bool,
    pub schema: Schema,
}

impl Parameter {
    pub fn path(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            location: "path".to_string(),
            required: true,
            schema: Schema {
                kind: "string".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "operationId")]
    pub operation_id: String,
    #[serde(rename = "x-kiln-target")]
    pub target: ServiceTarget,
    /// `Some(vec![])` disables security for this operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<SecurityRequirement>>,
    pub responses: BTreeMap<String, Response>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    #[serde(
        rename = "securitySchemes",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub security_schemes: BTreeMap<String, SecurityScheme>,
}

impl Components {
    pub fn is_empty(&self) -> bool {
        self.security_schemes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityScheme {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "openIdConnectUrl")]
    pub open_id_connect_url: String,
    #[serde(rename = "x-kiln-issuer")]
    pub issuer: String,
    #[serde(rename = "x-kiln-audiences", default)]
    pub audiences: Vec<String>,
}

/// Convert `:param` segments to `{param}` and collect the path parameters.
///
/// `/users/:id/orders/:orderId` becomes `/users/{id}/orders/{orderId}`.
pub fn convert_path(path: &str) -> (String, Vec<Parameter>) {
    let mut parameters = Vec::new();
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => {
                parameters.push(Parameter::path(name));
                format!("{{{name}}}")
            }
            _ => segment.to_string(),
        })
        .collect();
    (format!("/{}", segments.join("/")), parameters)
}

/// OpenAPI scheme for a declared definition; `None` if unsupported.
pub fn security_scheme(definition: &SecurityDefinition) -> Option<SecurityScheme> {
    match definition {
        SecurityDefinition::Oidc { issuer, audiences } => Some(SecurityScheme {
            kind: "openIdConnect".to_string(),
            open_id_connect_url: format!("{}{}", issuer.trim_end_matches('/'), OIDC_DISCOVERY_PATH),
            issuer: issuer.clone(),
            audiences: audiences.clone(),
        }),
        SecurityDefinition::Unsupported => None,
    }
}

/// One requirement per scheme: any listed scheme satisfies the API.
pub fn requirements(security: &BTreeMap<String, BTreeSet<String>>) -> Vec<SecurityRequirement> {
    security
        .iter()
        .map(|(scheme, scopes)| {
            BTreeMap::from([(scheme.clone(), scopes.iter().cloned().collect())])
        })
        .collect()
}

/// Operation-level security: opted out, overridden, or inherited (`None`).
pub fn route_security(options: &RouteOptions) -> Option<Vec<SecurityRequirement>> {
    if options.security_disabled {
        return Some(Vec::new());
    }
    if options.security.is_empty() {
        return None;
    }
    let security = options
        .security
        .iter()
        .map(|(scheme, scopes)| (scheme.clone(), scopes.iter().cloned().collect()))
        .collect();
    Some(requirements(&security))
}

fn operation_id(service: &str, method: HttpMethod, path: &str) -> String {
    let raw = format!("{service}-{}{path}", method.as_str());
    let mut id = String::with_capacity(raw.len());
    for c in raw.to_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' };
        if c == '-' && id.ends_with('-') {
            continue;
        }
        id.push(c);
    }
    id.trim_end_matches('-').to_string()
}

/// Assembles one API document from every service's routes.
pub struct ApiBuilder {
    name: String,
    document: OpenApiDocument,
    security: BTreeMap<String, BTreeSet<String>>,
    owners: BTreeMap<(String, HttpMethod), String>,
}

impl ApiBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            document: OpenApiDocument::new(&name),
            name,
            security: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    /// Merge API-wide security scopes declared by a service.
    pub fn add_api_security(&mut self, security: &BTreeMap<String, Vec<String>>) {
        for (scheme, scopes) in security {
            self.security
                .entry(scheme.clone())
                .or_default()
                .extend(scopes.iter().cloned());
        }
    }

    /// Add a security scheme. The first definition of a name is kept.
    pub fn add_security_definition(
        &mut self,
        name: &str,
        definition: &SecurityDefinition,
    ) -> Result<(), ProjectError> {
        let scheme = security_scheme(definition).ok_or_else(|| {
            ProjectError::UnsupportedSecurityScheme {
                api: self.name.clone(),
                name: name.to_string(),
            }
        })?;
        self.document
            .components
            .security_schemes
            .entry(name.to_string())
            .or_insert(scheme);
        Ok(())
    }

    /// Add a route's operations. Methods already claimed on the same path
    /// by another service are reported and left untouched.
    pub fn add_route(&mut self, service: &str, route: &RouteRegistration) -> Vec<ProjectError> {
        let (path, parameters) = convert_path(&route.path);
        let security = route_security(&route.options);
        let mut errors = Vec::new();

        for method in &route.methods {
            let key = (path.clone(), *method);
            if let Some(existing) = self.owners.get(&key) {
                errors.push(ProjectError::OverlappingRoute {
                    api: self.name.clone(),
                    method: *method,
                    path: path.clone(),
                    service: service.to_string(),
                    existing: existing.clone(),
                });
                continue;
            }
            self.owners.insert(key, service.to_string());

            let item = self
                .document
                .paths
                .entry(path.clone())
                .or_insert_with(|| PathItem {
                    parameters: parameters.clone(),
                    operations: BTreeMap::new(),
                });
            item.operations.insert(
                method.as_str().to_lowercase(),
                Operation {
                    operation_id: operation_id(service, *method, &path),
                    target: ServiceTarget::new(service),
                    security: security.clone(),
                    responses: BTreeMap::from([(
                        "default".to_string(),
                        Response {
                            description: "default response".to_string(),
                        },
                    )]),
                },
            );
        }
        errors
    }

    pub fn finish(mut self) -> OpenApiDocument {
        self.document.security = requirements(&self.security);
        self.document
    }
}
