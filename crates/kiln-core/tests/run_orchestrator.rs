//! Tests for running services until they exit or are stopped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kiln_core::project::{BuildContext, Service};
use kiln_core::run::{RunContext, RunOptions, RunStatus, RunUpdate, ServiceRunner, run_services};

/// Behaves according to the service name: `wait` runs until stopped,
/// `fail-N` fails after N * 20ms, anything else exits at once.
struct ScriptedRunner;

#[async_trait]
impl ServiceRunner for ScriptedRunner {
    async fn run(&self, service: &Service, ctx: RunContext) -> anyhow::Result<()> {
        ctx.report(RunUpdate::running(&service.name, format!("listening on {}", ctx.port)));
        if service.name.ends_with("wait") {
            ctx.cancel.cancelled().await;
            return Ok(());
        }
        if let Some((_, delay)) = service.name.split_once("fail-") {
            let delay: u64 = delay.parse()?;
            tokio::time::sleep(Duration::from_millis(delay * 20)).await;
            anyhow::bail!("exited with code 1");
        }
        Ok(())
    }
}

fn service(name: &str) -> Service {
    Service {
        name: name.to_string(),
        service_type: "default".to_string(),
        file_path: PathBuf::from(format!("{name}.ts")),
        build: BuildContext {
            dockerfile: String::new(),
            base_dir: PathBuf::from("."),
            args: BTreeMap::new(),
            ignore: Vec::new(),
        },
        start: None,
    }
}

fn options() -> RunOptions {
    RunOptions {
        port: 50051,
        ..RunOptions::default()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<RunUpdate>) -> Vec<RunUpdate> {
    let mut updates = Vec::new();
    while let Ok(update) = rx.try_recv() {
        updates.push(update);
    }
    updates
}

#[tokio::test]
async fn services_report_start_output_and_exit() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let services = vec![service("shop_a"), service("shop_b")];

    run_services(&services, Arc::new(ScriptedRunner), &options(), tx, CancellationToken::new())
        .await
        .unwrap();

    let updates = drain(&mut rx);
    for name in ["shop_a", "shop_b"] {
        let messages: Vec<(&str, RunStatus)> = updates
            .iter()
            .filter(|u| u.service_name == name)
            .map(|u| (u.message.as_str(), u.status))
            .collect();
        assert_eq!(
            messages,
            vec![
                ("Starting", RunStatus::Running),
                ("listening on 50051", RunStatus::Running),
                ("Stopped", RunStatus::Done),
            ]
        );
    }
}

#[tokio::test]
async fn cancellation_stops_every_service() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let services = vec![service("shop_a-wait"), service("shop_b-wait")];
    let cancel = CancellationToken::new();

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.cancel();
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        run_services(&services, Arc::new(ScriptedRunner), &options(), tx, cancel),
    )
    .await
    .expect("services did not stop")
    .unwrap();

    let done = drain(&mut rx)
        .into_iter()
        .filter(|u| u.status == RunStatus::Done)
        .count();
    assert_eq!(done, 2);
}

#[tokio::test]
async fn first_failure_in_service_order_is_returned() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let services = vec![service("shop_ok"), service("shop_fail-3"), service("shop_fail-1")];

    let err = run_services(&services, Arc::new(ScriptedRunner), &options(), tx, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("shop_fail-3"));

    let errors: Vec<RunUpdate> = drain(&mut rx)
        .into_iter()
        .filter(|u| u.status == RunStatus::Error)
        .collect();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|u| u.error.as_deref() == Some("exited with code 1")));
}
