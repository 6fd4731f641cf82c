//! Build orchestration
//!
//! Builds every service image concurrently, bounded by a semaphore sized to
//! the host's parallelism. Progress flows over a single unbounded channel
//! that is closed once every build has finished, whatever its outcome.

pub mod writer;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tempfile::TempDir;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ImageBuild};
use crate::project::{BuildContext, Service};

pub use writer::UpdateWriter;

/// Fallback when the host's parallelism cannot be determined.
pub const FALLBACK_PARALLELISM: usize = 4;

const DOCKERFILE_NAME: &str = "Dockerfile";
const DOCKERIGNORE_NAME: &str = "Dockerfile.dockerignore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    InProgress,
    Complete,
    Error,
    Skipped,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::InProgress)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::InProgress => "in progress",
            BuildStatus::Complete => "complete",
            BuildStatus::Error => "error",
            BuildStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUpdate {
    pub service_name: String,
    pub message: String,
    pub status: BuildStatus,
    /// Underlying failure for `Error` updates
    pub error: Option<String>,
}

impl BuildUpdate {
    fn status(service_name: &str, status: BuildStatus, message: impl Into<String>) -> Self {
        Self {
            service_name: service_name.to_string(),
            message: message.into(),
            status,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Concurrent build limit; `None` uses the host's parallelism
    pub max_parallel: Option<usize>,
    /// Build only these services; the rest are reported as skipped
    pub only: Option<BTreeSet<String>>,
}

impl BuildOptions {
    fn parallelism(&self) -> usize {
        self.max_parallel
            .filter(|n| *n > 0)
            .unwrap_or_else(default_parallelism)
    }

    fn selects(&self, service: &Service) -> bool {
        self.only
            .as_ref()
            .is_none_or(|only| only.contains(&service.name))
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_PARALLELISM)
}

/// Start building `services` and return the update stream.
///
/// The stream closes after every build has reported a terminal update.
/// A failed build never cancels the others.
pub fn build_services(
    engine: Arc<dyn ContainerEngine>,
    services: Vec<Service>,
    options: BuildOptions,
) -> mpsc::UnboundedReceiver<BuildUpdate> {
    let (tx, rx) = mpsc::unbounded_channel();
    let limit = options.parallelism();
    let semaphore = Arc::new(Semaphore::new(limit));

    let mut builders = JoinSet::new();
    for service in services {
        if !options.selects(&service) {
            let _ = tx.send(BuildUpdate::status(
                &service.name,
                BuildStatus::Skipped,
                "Skipped",
            ));
            continue;
        }
        builders.spawn(build_one(
            Arc::clone(&engine),
            Arc::clone(&semaphore),
            service,
            tx.clone(),
        ));
    }

    info!(builds = builders.len(), parallelism = limit, "Starting image builds");

    tokio::spawn(async move {
        while let Some(joined) = builders.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "Build task aborted");
            }
        }
        // Every permit back in the pool means no builder is still running.
        let permits = u32::try_from(limit).unwrap_or(u32::MAX);
        if let Ok(all) = semaphore.acquire_many(permits).await {
            drop(all);
        }
        drop(tx);
    });

    rx
}

async fn build_one(
    engine: Arc<dyn ContainerEngine>,
    semaphore: Arc<Semaphore>,
    service: Service,
    updates: mpsc::UnboundedSender<BuildUpdate>,
) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };

    let _ = updates.send(BuildUpdate::status(
        &service.name,
        BuildStatus::InProgress,
        "Building",
    ));
    debug!(service = %service.name, "Building image");

    let update = match run_build(engine.as_ref(), &service, &updates).await {
        Ok(()) => {
            info!(service = %service.name, "Image built");
            BuildUpdate::status(&service.name, BuildStatus::Complete, "Complete")
        }
        Err(err) => {
            warn!(service = %service.name, error = %format!("{err:#}"), "Image build failed");
            BuildUpdate {
                service_name: service.name.clone(),
                message: "Build failed".to_string(),
                status: BuildStatus::Error,
                error: Some(format!("{err:#}")),
            }
        }
    };
    let _ = updates.send(update);
}

async fn run_build(
    engine: &dyn ContainerEngine,
    service: &Service,
    updates: &mpsc::UnboundedSender<BuildUpdate>,
) -> anyhow::Result<()> {
    let descriptor = BuildDescriptor::materialize(&service.build)
        .with_context(|| format!("Failed to prepare build for {}", service.name))?;
    let tag = service.image_tag();
    let mut log = UpdateWriter::new(&service.name, updates.clone());

    engine
        .build(
            ImageBuild {
                dockerfile: &descriptor.dockerfile,
                context: &service.build.base_dir,
                tag: &tag,
                build_args: &service.build.args,
            },
            &mut log,
        )
        .await
}

/// Temporary Dockerfile plus its ignore file, removed on drop.
pub struct BuildDescriptor {
    _dir: TempDir,
    pub dockerfile: PathBuf,
    pub ignore_file: PathBuf,
}

impl BuildDescriptor {
    pub fn materialize(context: &BuildContext) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("kiln-build-").tempdir()?;
        let dockerfile = dir.path().join(DOCKERFILE_NAME);
        let ignore_file = dir.path().join(DOCKERIGNORE_NAME);
        std::fs::write(&dockerfile, &context.dockerfile)?;
        let mut ignore = context.ignore.join("\n");
        ignore.push('\n');
        std::fs::write(&ignore_file, ignore)?;
        Ok(Self {
            _dir: dir,
            dockerfile,
            ignore_file,
        })
    }
}

/// Terminal outcome per service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub complete: Vec<String>,
    pub skipped: Vec<String>,
    /// `(service, error)` pairs
    pub failed: Vec<(String, String)>,
}

impl BuildSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn record(&mut self, update: &BuildUpdate) {
        match update.status {
            BuildStatus::InProgress => {}
            BuildStatus::Complete => self.complete.push(update.service_name.clone()),
            BuildStatus::Skipped => self.skipped.push(update.service_name.clone()),
            BuildStatus::Error => self.failed.push((
                update.service_name.clone(),
                update.error.clone().unwrap_or_else(|| update.message.clone()),
            )),
        }
    }
}

/// Drain an update stream, returning the per-service outcomes.
pub async fn summarize(mut updates: mpsc::UnboundedReceiver<BuildUpdate>) -> BuildSummary {
    let mut summary = BuildSummary::default();
    while let Some(update) = updates.recv().await {
        summary.record(&update);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn descriptor_writes_dockerfile_and_ignore_rules() {
        let context = BuildContext {
            dockerfile: "FROM alpine\nARG HANDLER\n".to_string(),
            base_dir: PathBuf::from("."),
            args: BTreeMap::new(),
            ignore: vec![".git/".to_string(), "node_modules/".to_string()],
        };
        let descriptor = BuildDescriptor::materialize(&context).unwrap();
        assert_eq!(
            std::fs::read_to_string(&descriptor.dockerfile).unwrap(),
            context.dockerfile
        );
        assert_eq!(
            std::fs::read_to_string(&descriptor.ignore_file).unwrap(),
            ".git/\nnode_modules/\n"
        );
    }

    #[test]
    fn zero_parallelism_falls_back_to_host() {
        let options = BuildOptions {
            max_parallel: Some(0),
            only: None,
        };
        assert_eq!(options.parallelism(), default_parallelism());
    }
}
