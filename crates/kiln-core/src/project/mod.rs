//! Project model: services discovered from kiln.toml service globs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{PROJECT_FILE, ProjectConfig, parse_project_toml};

/// Ignore patterns applied to every build context.
pub const DEFAULT_IGNORE: &[&str] = &[".git/", ".kiln/"];

/// Build argument carrying the service's entry point.
pub const HANDLER_BUILD_ARG: &str = "HANDLER";

/// Placeholder substituted into start commands.
pub const SERVICE_PATH_VAR: &str = "$SERVICE_PATH";

#[derive(Debug, thiserror::Error)]
pub enum ProjectLoadError {
    #[error(transparent)]
    Config(#[from] anyhow::Error),

    #[error("invalid service pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("failed to read service path: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("failed to read dockerfile {path}: {source}")]
    Dockerfile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service name '{name}' is produced by both {first} and {second}")]
    DuplicateService {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Everything needed to build a service image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Dockerfile contents
    pub dockerfile: String,
    /// Directory used as the build context
    pub base_dir: PathBuf,
    pub args: BTreeMap<String, String>,
    pub ignore: Vec<String>,
}

/// One discovered execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Normalized, project-prefixed name
    pub name: String,
    pub service_type: String,
    /// Entry point relative to the project root
    pub file_path: PathBuf,
    pub build: BuildContext,
    /// Start command template, if the service can run as a local process
    pub start: Option<String>,
}

impl Service {
    /// Image reference the service is built into.
    pub fn image_tag(&self) -> String {
        self.name.clone()
    }

    /// Entry point with forward slashes.
    pub fn entry_point(&self) -> String {
        self.file_path.to_string_lossy().replace('\\', "/")
    }

    /// Start command with path variables substituted, split into argv.
    pub fn start_command(&self) -> Option<Vec<String>> {
        let template = self.start.as_ref()?;
        let command = template.replace(SERVICE_PATH_VAR, &self.entry_point());
        let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() { None } else { Some(argv) }
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
    pub services: Vec<Service>,
}

impl Project {
    /// Load `kiln.toml` from `root` and discover its services.
    pub fn load(root: &Path) -> Result<Self, ProjectLoadError> {
        let config = parse_project_toml(&root.join(PROJECT_FILE))?;
        Self::from_config(root, &config)
    }

    pub fn from_config(root: &Path, config: &ProjectConfig) -> Result<Self, ProjectLoadError> {
        let mut services = Vec::new();
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        let mut dockerfiles: HashMap<PathBuf, String> = HashMap::new();

        for group in &config.services {
            let runtime = config.runtimes.get(&group.runtime).ok_or_else(|| {
                anyhow::anyhow!(
                    "Services matching '{}' use unknown runtime '{}'",
                    group.pattern,
                    group.runtime
                )
            })?;

            let dockerfile_path = root.join(&runtime.dockerfile);
            let dockerfile = match dockerfiles.get(&dockerfile_path) {
                Some(content) => content.clone(),
                None => {
                    let content = std::fs::read_to_string(&dockerfile_path).map_err(|source| {
                        ProjectLoadError::Dockerfile {
                            path: dockerfile_path.clone(),
                            source,
                        }
                    })?;
                    dockerfiles.insert(dockerfile_path.clone(), content.clone());
                    content
                }
            };

            for relative in match_entry_points(root, &group.pattern)? {
                let name = service_name(&config.name, &relative);
                if let Some(first) = seen.get(&name) {
                    return Err(ProjectLoadError::DuplicateService {
                        name,
                        first: first.clone(),
                        second: relative,
                    });
                }
                seen.insert(name.clone(), relative.clone());

                let mut args = runtime.args.clone();
                args.insert(
                    HANDLER_BUILD_ARG.to_string(),
                    relative.to_string_lossy().replace('\\', "/"),
                );
                let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
                ignore.extend(runtime.ignore.iter().cloned());

                debug!(service = %name, path = %relative.display(), "Discovered service");
                services.push(Service {
                    name,
                    service_type: group.service_type.clone(),
                    file_path: relative,
                    build: BuildContext {
                        dockerfile: dockerfile.clone(),
                        base_dir: root.to_path_buf(),
                        args,
                        ignore,
                    },
                    start: group.start.clone(),
                });
            }
        }

        Ok(Self {
            name: config.name.clone(),
            root: root.to_path_buf(),
            services,
        })
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Entry points matching `pattern`, relative to `root`, sorted.
fn match_entry_points(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ProjectLoadError> {
    let full = root.join(pattern);
    let full = full.to_string_lossy();
    let paths = glob::glob(&full).map_err(|source| ProjectLoadError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let mut matches = Vec::new();
    for path in paths {
        let path = path?;
        if !path.is_file() {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        matches.push(relative);
    }
    matches.sort();
    Ok(matches)
}

/// `<project>_<entry point without extension>`, lower-cased, with every
/// character outside `[a-z0-9]` mapped to `-`.
pub fn service_name(project: &str, relative: &Path) -> String {
    let stem = relative.with_extension("");
    format!(
        "{}_{}",
        normalize(project),
        normalize(&stem.to_string_lossy())
    )
}

fn normalize(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names_are_normalized_and_prefixed() {
        assert_eq!(
            service_name("Shop", Path::new("services/Orders.api.ts")),
            "shop_services-orders-api"
        );
        assert_eq!(service_name("my shop", Path::new("main.py")), "my-shop_main");
    }

    #[test]
    fn start_command_substitutes_entry_point() {
        let service = Service {
            name: "shop_services-orders".to_string(),
            service_type: "default".to_string(),
            file_path: PathBuf::from("services/orders.ts"),
            build: BuildContext {
                dockerfile: String::new(),
                base_dir: PathBuf::from("."),
                args: BTreeMap::new(),
                ignore: Vec::new(),
            },
            start: Some("npx tsx $SERVICE_PATH --watch".to_string()),
        };
        assert_eq!(
            service.start_command().unwrap(),
            vec!["npx", "tsx", "services/orders.ts", "--watch"]
        );
    }
}
