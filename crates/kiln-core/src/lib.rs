//! Kiln Core Library
//!
//! Discovers the services of a project, builds their images, collects the
//! infrastructure each service declares, and synthesizes a deployment spec
//! for an external deployment provider.

pub mod build;
pub mod collect;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod project;
pub mod rpc;
pub mod run;
pub mod sandbox;
pub mod spec;
pub mod types;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{ProjectConfig, Settings, SettingsStore};

    // Project
    pub use crate::project::{Project, Service};

    // Build
    pub use crate::build::{BuildOptions, BuildStatus, BuildUpdate, build_services};

    // Collection
    pub use crate::collect::{
        CollectError, CollectOptions, CollectionServer, ServiceRequirements, collect_requirements,
    };
    pub use crate::sandbox::{ContainerSandbox, ProcessSandbox, Sandbox};

    // Spec
    pub use crate::spec::{DeploymentSpec, ProjectErrors, Synthesis, SynthesisError, synthesize};

    // Deploy
    pub use crate::deploy::{DeploymentEvent, DeploymentProvider, ProviderProcess};

    // Run
    pub use crate::run::{RunOptions, RunStatus, RunUpdate, ServiceRunner, run_services};

    // Engine
    pub use crate::engine::{ContainerEngine, DockerCli};
}
