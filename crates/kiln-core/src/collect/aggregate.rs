//! Fan-out/fan-in of collection runs across every service.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::requirements::ServiceRequirements;
use super::server::CollectionServer;
use crate::project::Service;
use crate::sandbox::Sandbox;

/// Upper bound on one service's collection run.
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    /// Interface collection servers bind to. `None` picks loopback, or all
    /// interfaces when the sandbox runs outside the host network.
    pub bind: Option<IpAddr>,
    /// A run still going after this long is a failure. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            bind: None,
            timeout: Some(DEFAULT_COLLECT_TIMEOUT),
        }
    }
}

impl CollectOptions {
    fn bind_addr(&self, sandbox: &dyn Sandbox) -> SocketAddr {
        let ip = self.bind.unwrap_or(if sandbox.needs_public_bind() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        SocketAddr::new(ip, 0)
    }
}

/// One service whose collection run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectFailure {
    pub service: String,
    pub message: String,
}

/// Every failed collection run, in service order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectError {
    pub failures: Vec<CollectFailure>,
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requirement collection failed for {} service(s)",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.service, failure.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for CollectError {}

struct Slots<T> {
    inner: Mutex<Vec<(usize, T)>>,
}

impl<T> Slots<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(usize, T)>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, index: usize, value: T) {
        self.lock().push((index, value));
    }

    fn into_sorted(self) -> Vec<T> {
        let mut entries = self.inner.into_inner().unwrap_or_else(PoisonError::into_inner);
        entries.sort_by_key(|(index, _)| *index);
        entries.into_iter().map(|(_, value)| value).collect()
    }
}

/// Run every service in `sandbox` concurrently and gather its requirements.
///
/// Results come back in the order of `services`. If any run fails, nothing
/// is returned except the joined failures.
pub async fn collect_requirements(
    services: &[Service],
    sandbox: Arc<dyn Sandbox>,
    options: CollectOptions,
) -> Result<Vec<ServiceRequirements>, CollectError> {
    let results = Arc::new(Slots::new());
    let errors = Arc::new(Slots::new());
    let bind = options.bind_addr(sandbox.as_ref());
    let timeout = options.timeout;

    info!(services = services.len(), "Collecting service requirements");

    let mut tasks = JoinSet::new();
    let mut task_services = HashMap::new();
    for (index, service) in services.iter().cloned().enumerate() {
        let sandbox = Arc::clone(&sandbox);
        let results = Arc::clone(&results);
        let errors = Arc::clone(&errors);
        let name = service.name.clone();
        let handle = tasks.spawn(async move {
            match collect_one(&service, sandbox.as_ref(), bind, timeout).await {
                Ok(requirements) => results.push(index, requirements),
                Err(message) => errors.push(
                    index,
                    CollectFailure {
                        service: service.name.clone(),
                        message,
                    },
                ),
            }
        });
        task_services.insert(handle.id(), (index, name));
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if let Some((index, service)) = task_services.get(&err.id()) {
                errors.push(
                    *index,
                    CollectFailure {
                        service: service.clone(),
                        message: format!("collection task failed: {err}"),
                    },
                );
            }
        }
    }

    let failures = take(errors).into_sorted();
    if !failures.is_empty() {
        return Err(CollectError { failures });
    }
    Ok(take(results).into_sorted())
}

fn take<T>(slots: Arc<Slots<T>>) -> Slots<T> {
    Arc::try_unwrap(slots).unwrap_or_else(|shared| Slots {
        inner: Mutex::new(std::mem::take(&mut *shared.lock())),
    })
}

async fn collect_one(
    service: &Service,
    sandbox: &dyn Sandbox,
    bind: SocketAddr,
    timeout: Option<Duration>,
) -> Result<ServiceRequirements, String> {
    let server = CollectionServer::start(bind, &service.name, &service.service_type)
        .await
        .map_err(|err| format!("failed to start collection server: {err}"))?;
    debug!(service = %service.name, port = server.port(), "Running service in collection mode");

    let run = sandbox.run_collection(service, server.local_addr());
    let run = match timeout {
        Some(limit) => tokio::time::timeout(limit, run).await.unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "timed out after {:?} during collection",
                limit
            ))
        }),
        None => run.await,
    };
    let requirements = server.shutdown().await;

    match run {
        Ok(()) => {
            debug!(service = %service.name, "Collected requirements");
            Ok(requirements)
        }
        Err(err) => {
            warn!(service = %service.name, error = %format!("{err:#}"), "Collection run failed");
            Err(format!("{err:#}"))
        }
    }
}
