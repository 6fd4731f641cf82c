//! Configuration management
//!
//! Two layers of configuration:
//! - Project: kiln.toml at the project root (services and runtimes)
//! - Settings: per-user defaults for building, collecting, running, deploying

pub mod parser;
pub mod schema;
pub mod store;

pub use parser::{parse_project_toml, parse_project_toml_str, parse_settings_toml_str};
pub use schema::{
    BuildSettings, CollectSettings, DeploySettings, ProjectConfig, RunSettings, RuntimeConfig,
    ServiceGroup, Settings,
};
pub use store::SettingsStore;

/// File name of the project configuration
pub const PROJECT_FILE: &str = "kiln.toml";
