//! Tests for concurrent image builds against an in-memory engine.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kiln_core::build::{BuildOptions, BuildStatus, BuildUpdate, build_services, summarize};
use kiln_core::engine::{ContainerEngine, ContainerSpec, ImageBuild};
use kiln_core::project::{BuildContext, HANDLER_BUILD_ARG, Service};

/// Engine that records builds and fails any tag listed in `failing`.
#[derive(Default)]
struct FakeEngine {
    failing: BTreeSet<String>,
    builds: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeEngine {
    fn failing(tags: &[&str]) -> Self {
        Self {
            failing: tags.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn build(
        &self,
        build: ImageBuild<'_>,
        log: &mut (dyn Write + Send),
    ) -> anyhow::Result<()> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        assert!(build.dockerfile.exists());
        writeln!(log, "Step 1/2 : FROM alpine")?;
        writeln!(log, "Step 2/2 : COPY . .")?;
        tokio::time::sleep(Duration::from_millis(20)).await;

        self.builds
            .lock()
            .unwrap()
            .push((build.tag.to_string(), build.build_args.clone()));
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(build.tag) {
            anyhow::bail!("step 2 failed: no such file");
        }
        Ok(())
    }

    async fn start(&self, _spec: &ContainerSpec) -> anyhow::Result<String> {
        unimplemented!("not used by builds")
    }

    async fn attach(&self, _id: &str) -> anyhow::Result<mpsc::Receiver<Vec<u8>>> {
        unimplemented!("not used by builds")
    }

    async fn wait(&self, _id: &str) -> anyhow::Result<i64> {
        unimplemented!("not used by builds")
    }

    async fn stop(&self, _id: &str, _timeout: Duration) -> anyhow::Result<()> {
        unimplemented!("not used by builds")
    }

    async fn kill(&self, _id: &str) -> anyhow::Result<()> {
        unimplemented!("not used by builds")
    }

    async fn logs(&self, _id: &str, _tail: usize) -> anyhow::Result<String> {
        unimplemented!("not used by builds")
    }

    async fn remove(&self, _id: &str) -> anyhow::Result<()> {
        unimplemented!("not used by builds")
    }
}

fn service(name: &str, path: &str) -> Service {
    Service {
        name: name.to_string(),
        service_type: "default".to_string(),
        file_path: PathBuf::from(path),
        build: BuildContext {
            dockerfile: "FROM alpine\nARG HANDLER\nCOPY . .\n".to_string(),
            base_dir: std::env::temp_dir(),
            args: BTreeMap::from([(HANDLER_BUILD_ARG.to_string(), path.to_string())]),
            ignore: vec![".git/".to_string()],
        },
        start: None,
    }
}

fn terminal_statuses(updates: &[BuildUpdate]) -> BTreeMap<String, BuildStatus> {
    updates
        .iter()
        .filter(|u| u.status.is_terminal())
        .map(|u| (u.service_name.clone(), u.status))
        .collect()
}

async fn drain(mut rx: mpsc::UnboundedReceiver<BuildUpdate>) -> Vec<BuildUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    updates
}

#[tokio::test]
async fn every_service_reports_one_terminal_update() {
    let engine = Arc::new(FakeEngine::default());
    let services = vec![
        service("shop_a", "services/a.ts"),
        service("shop_b", "services/b.ts"),
        service("shop_c", "services/c.ts"),
    ];

    let updates = drain(build_services(engine.clone(), services, BuildOptions::default())).await;

    let terminal: Vec<&BuildUpdate> = updates.iter().filter(|u| u.status.is_terminal()).collect();
    assert_eq!(terminal.len(), 3);
    assert!(terminal.iter().all(|u| u.status == BuildStatus::Complete));

    let progress: Vec<&str> = updates
        .iter()
        .filter(|u| u.service_name == "shop_a" && u.status == BuildStatus::InProgress)
        .map(|u| u.message.as_str())
        .collect();
    assert!(progress.contains(&"Step 1/2 : FROM alpine"));
}

#[tokio::test]
async fn failed_build_does_not_stop_the_others() {
    let engine = Arc::new(FakeEngine::failing(&["shop_b"]));
    let services = vec![service("shop_a", "a.ts"), service("shop_b", "b.ts")];

    let summary = summarize(build_services(engine, services, BuildOptions::default())).await;

    assert!(!summary.is_success());
    assert_eq!(summary.complete, vec!["shop_a"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "shop_b");
    assert!(summary.failed[0].1.contains("no such file"));
}

#[tokio::test]
async fn unselected_services_are_skipped() {
    let engine = Arc::new(FakeEngine::default());
    let services = vec![service("shop_a", "a.ts"), service("shop_b", "b.ts")];
    let options = BuildOptions {
        max_parallel: None,
        only: Some(BTreeSet::from(["shop_b".to_string()])),
    };

    let updates = drain(build_services(engine.clone(), services, options)).await;
    let statuses = terminal_statuses(&updates);

    assert_eq!(statuses["shop_a"], BuildStatus::Skipped);
    assert_eq!(statuses["shop_b"], BuildStatus::Complete);
    let built: Vec<String> = engine.builds.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
    assert_eq!(built, vec!["shop_b"]);
}

#[tokio::test]
async fn builds_respect_the_parallelism_limit() {
    let engine = Arc::new(FakeEngine::default());
    let services: Vec<Service> = (0..6)
        .map(|i| service(&format!("shop_{i}"), &format!("{i}.ts")))
        .collect();
    let options = BuildOptions {
        max_parallel: Some(2),
        only: None,
    };

    let summary = summarize(build_services(engine.clone(), services, options)).await;

    assert_eq!(summary.complete.len(), 6);
    assert!(engine.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn handler_argument_reaches_the_engine() {
    let engine = Arc::new(FakeEngine::default());
    let services = vec![service("shop_orders", "services/orders.ts")];

    summarize(build_services(engine.clone(), services, BuildOptions::default())).await;

    let builds = engine.builds.lock().unwrap();
    assert_eq!(builds[0].0, "shop_orders");
    assert_eq!(builds[0].1[HANDLER_BUILD_ARG], "services/orders.ts");
}

#[tokio::test]
async fn empty_project_closes_the_stream() {
    let engine = Arc::new(FakeEngine::default());
    let updates = drain(build_services(engine, Vec::new(), BuildOptions::default())).await;
    assert!(updates.is_empty());
}
