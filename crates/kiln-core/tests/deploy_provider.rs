//! Tests for the child-process deployment provider.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use kiln_core::deploy::{
    DeployError, DeploymentEvent, DeploymentProvider, ProviderProcess, parse_attributes,
};
use kiln_core::spec::{DeploymentSpec, Resource, ResourceConfig, TopicConfig};

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// Scripts are written up front and every scenario runs in one test, so no
// process is forked while a script is still open for writing.
#[tokio::test]
async fn provider_process_relays_events_and_errors() {
    let dir = TempDir::new().unwrap();
    let request = dir.path().join("request.json");
    let succeeding = script(
        dir.path(),
        "succeeding",
        &format!(
            r#"cat > "{}"
echo "$1 started"
echo '{{"kind":"message","message":"creating topic orders"}}'
echo '{{"kind":"result","success":true,"message":"done"}}'"#,
            request.display()
        ),
    );
    let failing = script(
        dir.path(),
        "failing",
        r#"cat > /dev/null
echo 'quota exceeded' >&2
exit 3"#,
    );

    let attributes = parse_attributes("region = \"eu-west-1\"\n").unwrap();
    let spec = DeploymentSpec {
        resources: vec![Resource::new("orders", ResourceConfig::Topic(TopicConfig::default()))],
    };

    let mut events = Vec::new();
    let errors = ProviderProcess::new(&succeeding)
        .up(&spec, &attributes)
        .await
        .unwrap()
        .relay(|event| events.push(event.clone()))
        .await;
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(
        events,
        vec![
            DeploymentEvent::Message {
                message: "up started".to_string()
            },
            DeploymentEvent::Message {
                message: "creating topic orders".to_string()
            },
            DeploymentEvent::Result {
                success: true,
                message: "done".to_string()
            },
        ]
    );

    let sent: serde_json::Value = serde_json::from_str(&fs::read_to_string(&request).unwrap()).unwrap();
    assert_eq!(sent["operation"], "up");
    assert_eq!(sent["attributes"]["region"], "eu-west-1");
    assert_eq!(sent["spec"]["resources"][0]["name"], "orders");
    assert_eq!(sent["spec"]["resources"][0]["type"], "topic");

    let errors = ProviderProcess::new(&failing)
        .down(&attributes)
        .await
        .unwrap()
        .relay(|_| {})
        .await;
    assert_eq!(errors.len(), 2);
    assert!(matches!(&errors[0], DeployError::Provider(line) if line == "quota exceeded"));
    assert!(matches!(&errors[1], DeployError::Exit(_)));

    let missing = ProviderProcess::new(dir.path().join("missing"));
    assert!(matches!(
        missing.down(&attributes).await,
        Err(DeployError::Spawn { .. })
    ));
}
