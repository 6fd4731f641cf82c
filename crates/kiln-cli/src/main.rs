//! Kiln - build, inspect, run, and deploy multi-service projects
//!
//! Usage:
//!   kiln build          # Build every service image
//!   kiln spec           # Collect requirements and print the deployment spec
//!   kiln run            # Run every service locally
//!   kiln up --stack f   # Deploy through the configured provider
//!   kiln down --stack f # Tear the deployment down

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_core::build::{BuildOptions, BuildStatus, build_services};
use kiln_core::collect::{CollectOptions, collect_requirements};
use kiln_core::config::{Settings, SettingsStore};
use kiln_core::deploy::{DeploymentEvent, DeploymentProvider, ProviderProcess, load_attributes};
use kiln_core::engine::{ContainerEngine, DockerCli};
use kiln_core::project::Project;
use kiln_core::run::{
    ContainerRunner, ProcessRunner, RunOptions, RunStatus, ServiceRunner, run_services,
};
use kiln_core::sandbox::{ContainerSandbox, ProcessSandbox, Sandbox};
use kiln_core::spec::{Synthesis, synthesize};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Multi-service build and deployment orchestrator", long_about = None)]
struct Cli {
    /// Project root containing kiln.toml
    #[arg(short = 'C', long, global = true, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build service images
    Build(BuildArgs),

    /// Collect requirements and print the deployment spec
    Spec(SpecArgs),

    /// Run every service against the local emulation endpoint
    Run {
        /// Run built images instead of start commands
        #[arg(long)]
        containers: bool,

        /// Port of the local emulation endpoint
        #[arg(long)]
        port: Option<u16>,
    },

    /// Deploy the project
    Up {
        #[command(flatten)]
        deploy: DeployArgs,

        #[command(flatten)]
        collect: CollectArgs,
    },

    /// Tear down a deployment
    Down {
        #[command(flatten)]
        deploy: DeployArgs,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Only build these services
    #[arg(long = "only", value_name = "SERVICE")]
    only: Vec<String>,

    /// Maximum concurrent builds
    #[arg(long)]
    max_parallel: Option<usize>,
}

#[derive(Args)]
struct CollectArgs {
    /// Environment variable for every service (KEY=VALUE)
    #[arg(long, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Collect from start commands instead of built images
    #[arg(long)]
    processes: bool,
}

#[derive(Args)]
struct SpecArgs {
    #[command(flatten)]
    collect: CollectArgs,

    /// Write the spec to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct DeployArgs {
    /// Stack attributes file (TOML)
    #[arg(long)]
    stack: PathBuf,

    /// Deployment provider executable (overrides settings)
    #[arg(long)]
    provider: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = SettingsStore::from_default_dir()?.load()?;
    let root = cli.project_dir.as_path();

    match cli.command {
        Commands::Build(args) => run_build(root, &settings, args).await,
        Commands::Spec(args) => run_spec(root, &settings, args).await,
        Commands::Run { containers, port } => run_run(root, &settings, containers, port).await,
        Commands::Up { deploy, collect } => run_up(root, &settings, deploy, collect).await,
        Commands::Down { deploy } => run_down(&settings, deploy).await,
    }
}

fn docker() -> Arc<dyn ContainerEngine> {
    Arc::new(DockerCli::default())
}

/// Build every selected image, failing if any build failed.
async fn build_project(project: &Project, options: BuildOptions) -> Result<()> {
    let mut updates = build_services(docker(), project.services.clone(), options);
    let mut failed = Vec::new();
    while let Some(update) = updates.recv().await {
        match update.status {
            BuildStatus::InProgress => println!("[{}] {}", update.service_name, update.message),
            BuildStatus::Error => {
                let error = update.error.unwrap_or(update.message);
                eprintln!("[{}] build failed: {}", update.service_name, error);
                failed.push(update.service_name);
            }
            status => println!("[{}] {}", update.service_name, status),
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("{} build(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

fn load_project(root: &Path) -> Result<Project> {
    let project = Project::load(root)?;
    debug!(project = %project.name, services = project.services.len(), "Loaded project");
    Ok(project)
}

async fn run_build(root: &Path, settings: &Settings, args: BuildArgs) -> Result<()> {
    let project = load_project(root)?;
    let only: BTreeSet<String> = args.only.into_iter().collect();
    let options = BuildOptions {
        max_parallel: args.max_parallel.or(settings.build.max_parallel),
        only: (!only.is_empty()).then_some(only),
    };
    build_project(&project, options).await?;
    println!("Built {} service(s)", project.services.len());
    Ok(())
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| anyhow::anyhow!("Invalid env format: {pair}. Use KEY=VALUE"))
        })
        .collect()
}

/// Build (when collecting from images), collect, and synthesize.
async fn synthesize_project(
    root: &Path,
    settings: &Settings,
    args: &CollectArgs,
) -> Result<Synthesis> {
    let project = load_project(root)?;
    let env = parse_env(&args.env)?;

    let use_containers = settings.collect.containers && !args.processes;
    let sandbox: Arc<dyn Sandbox> = if use_containers {
        build_project(
            &project,
            BuildOptions {
                max_parallel: settings.build.max_parallel,
                only: None,
            },
        )
        .await?;
        Arc::new(
            ContainerSandbox::new(docker()).with_log_tail(settings.run.log_tail),
        )
    } else {
        Arc::new(
            ProcessSandbox::new(&project.root).with_log_tail(settings.run.log_tail),
        )
    };

    let options = CollectOptions {
        timeout: Some(Duration::from_secs(settings.collect.timeout_secs)),
        ..CollectOptions::default()
    };
    let requirements = collect_requirements(&project.services, sandbox, options).await?;
    Ok(synthesize(&requirements, &env)?)
}

async fn run_spec(root: &Path, settings: &Settings, args: SpecArgs) -> Result<()> {
    let synthesis = synthesize_project(root, settings, &args.collect).await?;
    let json = synthesis.spec.to_json_pretty()?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, &json)
                .with_context(|| format!("Failed to write spec: {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        None => println!("{json}"),
    }
    synthesis.into_result()?;
    Ok(())
}

async fn run_run(
    root: &Path,
    settings: &Settings,
    containers: bool,
    port: Option<u16>,
) -> Result<()> {
    let project = load_project(root)?;
    let mut options = RunOptions::from_settings(&settings.run, &project.root);
    options.use_containers |= containers;
    if let Some(port) = port {
        options.port = port;
    }

    let runner: Arc<dyn ServiceRunner> = if options.use_containers {
        build_project(
            &project,
            BuildOptions {
                max_parallel: settings.build.max_parallel,
                only: None,
            },
        )
        .await?;
        Arc::new(ContainerRunner::new(docker()))
    } else {
        Arc::new(ProcessRunner::new(&project.root))
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Stopping services...");
            on_interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<kiln_core::run::RunUpdate>();
    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update.status {
                RunStatus::Running | RunStatus::Done => {
                    println!("[{}] {}", update.service_name, update.message)
                }
                RunStatus::Error => eprintln!(
                    "[{}] {}",
                    update.service_name,
                    update.error.unwrap_or(update.message)
                ),
            }
        }
    });

    let result = run_services(&project.services, runner, &options, tx, cancel).await;
    let _ = printer.await;
    result
}

fn provider(settings: &Settings, args: &DeployArgs) -> Result<ProviderProcess> {
    let program = args
        .provider
        .clone()
        .or_else(|| settings.deploy.provider.clone())
        .ok_or_else(|| {
            anyhow::anyhow!("No deployment provider configured. Use --provider or [deploy] provider")
        })?;
    Ok(ProviderProcess::new(program))
}

fn print_event(event: &DeploymentEvent) {
    match event {
        DeploymentEvent::Message { message } => println!("{message}"),
        DeploymentEvent::Result { success, message } => {
            let outcome = if *success { "succeeded" } else { "failed" };
            println!("Deployment {outcome}: {message}");
        }
    }
}

async fn run_up(
    root: &Path,
    settings: &Settings,
    deploy: DeployArgs,
    collect: CollectArgs,
) -> Result<()> {
    let provider = provider(settings, &deploy)?;
    let attributes = load_attributes(&deploy.stack)?;
    let spec = synthesize_project(root, settings, &collect)
        .await?
        .into_result()?;

    let errors = provider.up(&spec, &attributes).await?.relay(print_event).await;
    report_deploy_errors(errors)
}

async fn run_down(settings: &Settings, deploy: DeployArgs) -> Result<()> {
    let provider = provider(settings, &deploy)?;
    let attributes = load_attributes(&deploy.stack)?;

    let errors = provider.down(&attributes).await?.relay(print_event).await;
    report_deploy_errors(errors)
}

fn report_deploy_errors(errors: Vec<kiln_core::deploy::DeployError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for err in &errors {
        eprintln!("{err}");
    }
    anyhow::bail!("deployment reported {} error(s)", errors.len())
}
