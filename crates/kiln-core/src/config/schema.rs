//! Configuration schema for kiln.toml and settings.toml
//!
//! - Project: ./kiln.toml (services, runtimes)
//! - Settings: ~/.config/kiln/settings.toml (per-user defaults)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure for kiln.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    /// Project name, used to prefix service names
    pub name: String,

    /// Service groups, each matching entry points by glob
    #[serde(default)]
    pub services: Vec<ServiceGroup>,

    /// Named build runtimes referenced by service groups
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeConfig>,
}

/// A glob of service entry points sharing one runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGroup {
    /// Glob relative to the project root, e.g. "services/*.ts"
    #[serde(rename = "match")]
    pub pattern: String,

    /// Runtime name (key into [runtimes])
    pub runtime: String,

    /// Free-form service type tag
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,

    /// Local start command; `$SERVICE_PATH` is replaced with the entry point
    #[serde(default)]
    pub start: Option<String>,
}

fn default_service_type() -> String {
    "default".to_string()
}

/// How to build images for a group of services
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Dockerfile path relative to the project root
    pub dockerfile: PathBuf,

    /// Build arguments
    #[serde(default)]
    pub args: BTreeMap<String, String>,

    /// Extra ignore patterns for the build context
    #[serde(default)]
    pub ignore: Vec<String>,
}

/// Per-user settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub collect: CollectSettings,

    #[serde(default)]
    pub run: RunSettings,

    #[serde(default)]
    pub deploy: DeploySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BuildSettings {
    /// Upper bound on concurrent image builds (defaults to CPU parallelism)
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectSettings {
    /// Collect requirements from containers instead of local processes
    #[serde(default = "default_true")]
    pub containers: bool,

    /// Seconds a service may run in collection mode before it counts as hung
    #[serde(default = "default_collect_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectSettings {
    fn default() -> Self {
        Self {
            containers: true,
            timeout_secs: default_collect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSettings {
    /// Run services as containers instead of local processes
    #[serde(default)]
    pub containers: bool,

    /// Lines of output reported when a service fails
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,

    /// Grace period before a stopping service is killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Port of the local emulation endpoint (0 allocates one)
    #[serde(default)]
    pub port: u16,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            containers: false,
            log_tail: default_log_tail(),
            stop_timeout_secs: default_stop_timeout(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeploySettings {
    /// Deployment provider executable
    #[serde(default)]
    pub provider: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_collect_timeout() -> u64 {
    300
}

fn default_log_tail() -> usize {
    20
}

fn default_stop_timeout() -> u64 {
    10
}
