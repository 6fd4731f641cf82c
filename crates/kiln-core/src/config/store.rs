//! Settings store for loading and saving settings.toml.

use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{Settings, parser};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone)]
pub struct SettingsStore {
    settings_path: PathBuf,
}

impl SettingsStore {
    pub fn from_default_dir() -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("kiln");
        Ok(Self::from_dir(config_dir))
    }

    pub fn from_dir(config_dir: PathBuf) -> Self {
        Self {
            settings_path: config_dir.join(SETTINGS_FILE),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn load(&self) -> anyhow::Result<Settings> {
        if !self.settings_path.exists() {
            return Ok(Settings::default());
        }
        let content = std::fs::read_to_string(&self.settings_path).with_context(|| {
            format!(
                "Failed to read settings file: {}",
                self.settings_path.display()
            )
        })?;
        parser::parse_settings_toml_str(&content).with_context(|| {
            format!(
                "Failed to parse settings file: {}",
                self.settings_path.display()
            )
        })
    }

    pub fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let content = parser::settings_to_toml(settings)?;
        if let Some(parent) = self.settings_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(&self.settings_path, content).with_context(|| {
            format!(
                "Failed to write settings file: {}",
                self.settings_path.display()
            )
        })?;
        Ok(())
    }
}
