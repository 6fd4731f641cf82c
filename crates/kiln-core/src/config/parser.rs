//! TOML parsing for kiln.toml and settings.toml

use anyhow::Context;
use std::path::Path;

use super::schema::{ProjectConfig, Settings};

/// Parse a kiln.toml file from disk
pub fn parse_project_toml(path: &Path) -> anyhow::Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    parse_project_toml_str(&content)
        .with_context(|| format!("Failed to parse project file: {}", path.display()))
}

/// Parse kiln.toml content
pub fn parse_project_toml_str(content: &str) -> anyhow::Result<ProjectConfig> {
    let config: ProjectConfig = toml::from_str(content)?;
    validate_project(&config)?;
    Ok(config)
}

/// Parse settings.toml content
pub fn parse_settings_toml_str(content: &str) -> anyhow::Result<Settings> {
    Ok(toml::from_str(content)?)
}

/// Serialize settings back to TOML
pub fn settings_to_toml(settings: &Settings) -> anyhow::Result<String> {
    toml::to_string_pretty(settings).context("Failed to serialize settings to TOML")
}

fn validate_project(config: &ProjectConfig) -> anyhow::Result<()> {
    if config.name.trim().is_empty() {
        anyhow::bail!("Project name must not be empty");
    }
    for group in &config.services {
        if !config.runtimes.contains_key(&group.runtime) {
            anyhow::bail!(
                "Services matching '{}' use unknown runtime '{}'",
                group.pattern,
                group.runtime
            );
        }
    }
    Ok(())
}
