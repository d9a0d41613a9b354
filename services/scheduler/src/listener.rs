//! Listener supervisor.
//!
//! [`ServiceListener::run`] watches the set of services and keeps one loop
//! per service alive. Each service loop ([`ServiceListener::spawn`]) runs a
//! reconciliation pass, then sleeps until the service record changes, its
//! instance set or the host registry changes, the periodic tick fires, or
//! shutdown is requested.

use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use shepherd_coord::{CoordError, Coordinator, CreateMode, Watch, WatchEvent};
use shepherd_id::ServiceId;
use shepherd_reconcile::{BackoffPolicy, DEFAULT_SYNC_INTERVAL};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Reconciler;
use crate::error::RecordError;
use crate::paths;
use crate::records::{self, Service};
use crate::selector::HostSelector;

/// Timing knobs for the listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Interval between unconditional passes.
    pub sync_interval: Duration,

    /// Delay schedule after a failed pass.
    pub backoff: BackoffPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Outcome of one service pass.
enum Pass {
    /// The service still exists; wait on these watches.
    Wait {
        data: Watch,
        children: Option<Watch>,
        hosts: Option<Watch>,
    },
    /// The service record is gone.
    Removed,
}

/// A running per-service loop.
struct ServiceLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Supervises per-service reconciliation loops.
#[derive(Clone)]
pub struct ServiceListener {
    reconciler: Arc<Reconciler>,
    config: ListenerConfig,
}

impl ServiceListener {
    pub fn new(
        conn: Arc<dyn Coordinator>,
        selector: Arc<dyn HostSelector>,
        config: ListenerConfig,
    ) -> Self {
        Self::with_reconciler(Arc::new(Reconciler::new(conn, selector)), config)
    }

    /// Build a listener sharing an existing reconciler.
    pub fn with_reconciler(reconciler: Arc<Reconciler>, config: ListenerConfig) -> Self {
        Self { reconciler, config }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    fn conn(&self) -> &Arc<dyn Coordinator> {
        self.reconciler.records().conn()
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    /// Run until shutdown is signaled, keeping one loop per service.
    ///
    /// On shutdown every service loop is told to stop and awaited.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sync_interval_secs = self.config.sync_interval.as_secs(),
            "Starting service listener"
        );

        let mut loops: HashMap<ServiceId, ServiceLoop> = HashMap::new();
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let services_watch = match self.watch_services().await {
                Ok((services, watch)) => {
                    attempt = 0;
                    self.reap(&mut loops).await;
                    self.reconcile_loops(&mut loops, services).await;
                    watch
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Failed to list services");
                    if self.backoff(&mut shutdown, attempt).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            tokio::select! {
                result = services_watch.changed() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Service watch closed");
                    }
                }
                _ = tokio::time::sleep(self.config.sync_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(loops = loops.len(), "Service listener shutting down");
        for (_, service_loop) in loops.iter() {
            let _ = service_loop.stop.send(true);
        }
        for (service_id, service_loop) in loops {
            if let Err(e) = service_loop.handle.await {
                error!(%service_id, error = %e, "Service loop panicked");
            }
        }
        info!("Service listener stopped");
    }

    async fn watch_services(&self) -> Result<(Vec<String>, Watch), CoordError> {
        match self.conn().children_w(paths::SERVICES).await {
            Err(CoordError::NoNode(_)) => {
                self.conn()
                    .create(paths::SERVICES, Vec::new(), CreateMode::Persistent)
                    .await
                    .or_else(|e| match e {
                        CoordError::NodeExists(_) => Ok(String::new()),
                        e => Err(e),
                    })?;
                self.conn().children_w(paths::SERVICES).await
            }
            other => other,
        }
    }

    /// Stop and join loops of removed services, then start loops for new
    /// ones. A stopped loop leaves `loops` before this returns, so a service
    /// recreated later gets a fresh loop.
    async fn reconcile_loops(
        &self,
        loops: &mut HashMap<ServiceId, ServiceLoop>,
        names: Vec<String>,
    ) {
        let wanted: HashSet<ServiceId> = names
            .iter()
            .filter_map(|name| match ServiceId::parse(name) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(child = %name, error = %e, "Ignoring invalid service node");
                    None
                }
            })
            .collect();

        let removed: Vec<ServiceId> = loops
            .keys()
            .filter(|id| !wanted.contains(*id))
            .cloned()
            .collect();
        let mut stopping = Vec::with_capacity(removed.len());
        for service_id in removed {
            if let Some(service_loop) = loops.remove(&service_id) {
                let _ = service_loop.stop.send(true);
                stopping.push((service_id, service_loop.handle));
            }
        }
        for (service_id, handle) in stopping {
            if let Err(e) = handle.await {
                error!(%service_id, error = %e, "Service loop panicked");
            }
            debug!(%service_id, "Stopped service loop");
        }

        for service_id in &wanted {
            if loops.contains_key(service_id) {
                continue;
            }
            let (stop, rx) = watch::channel(false);
            let listener = self.clone();
            let id = service_id.clone();
            let handle = tokio::spawn(async move { listener.spawn(id, rx).await });
            debug!(%service_id, "Spawned service loop");
            loops.insert(service_id.clone(), ServiceLoop { stop, handle });
        }
    }

    /// Drop loops that have finished.
    async fn reap(&self, loops: &mut HashMap<ServiceId, ServiceLoop>) {
        let finished: Vec<ServiceId> = loops
            .iter()
            .filter(|(_, l)| l.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for service_id in finished {
            if let Some(service_loop) = loops.remove(&service_id) {
                if let Err(e) = service_loop.handle.await {
                    error!(%service_id, error = %e, "Service loop panicked");
                }
                debug!(%service_id, "Reaped service loop");
            }
        }
    }

    // =========================================================================
    // Per-service loop
    // =========================================================================

    /// Run the reconciliation loop for one service until it is removed or
    /// `shutdown` is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn spawn(&self, service_id: ServiceId, mut shutdown: watch::Receiver<bool>) {
        info!("Starting service loop");
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let (data, children, hosts) = match self.pass(&service_id).await {
                Ok(Pass::Wait {
                    data,
                    children,
                    hosts,
                }) => {
                    attempt = 0;
                    (data, children, hosts)
                }
                Ok(Pass::Removed) => {
                    info!("Service removed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Service pass failed");
                    if self.backoff(&mut shutdown, attempt).await {
                        break;
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            let children = changed_or_pending(children);
            let hosts = changed_or_pending(hosts);

            tokio::select! {
                result = data.changed() => {
                    if let Ok(event) = result {
                        debug!(kind = ?event.kind, "Service record changed");
                    }
                }
                result = children => {
                    if let Ok(event) = result {
                        debug!(kind = ?event.kind, "Instance set changed");
                    }
                }
                result = hosts => {
                    if let Ok(event) = result {
                        debug!(kind = ?event.kind, "Host registry changed");
                    }
                }
                _ = tokio::time::sleep(self.config.sync_interval) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Service loop stopped");
    }

    /// One pass: read the service, clean orphaned instances, then sync.
    ///
    /// Clean and sync failures are logged and retried on the next pass;
    /// only failures to read the service or its instances are returned.
    async fn pass(&self, service_id: &ServiceId) -> Result<Pass, RecordError> {
        let path = paths::service(service_id);

        let (node, data) = match self.conn().get_w(&path).await {
            Ok(v) => v,
            Err(CoordError::NoNode(_)) => return Ok(Pass::Removed),
            Err(e) => return Err(e.into()),
        };

        let service: Service = match records::decode(&path, &node) {
            Ok(service) => service,
            Err(e) => {
                warn!(error = %e, "Service record unreadable, waiting for it to change");
                return Ok(Pass::Wait {
                    data,
                    children: None,
                    hosts: None,
                });
            }
        };

        let children = match self.conn().children_w(&path).await {
            Ok((_, watch)) => watch,
            Err(CoordError::NoNode(_)) => return Ok(Pass::Removed),
            Err(e) => return Err(e.into()),
        };

        // Hosts leaving the registry orphan their instances.
        let hosts = match self.conn().children_w(paths::HOST_REGISTRY).await {
            Ok((_, watch)) => Some(watch),
            Err(CoordError::NoNode(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let records = self.reconciler.records();
        let mut instances = match records.load_running_by_service(service_id).await {
            Ok(instances) => instances,
            Err(e) if e.is_not_found() => return Ok(Pass::Removed),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.reconciler.clean(&mut instances).await {
            warn!(error = %e, "Clean failed");
        }
        if let Err(e) = self.reconciler.sync(&service, &instances).await {
            warn!(error = %e, "Sync failed");
        }

        Ok(Pass::Wait {
            data,
            children: Some(children),
            hosts,
        })
    }

    /// Sleep out a retry delay. Returns true if shutdown was signaled.
    async fn backoff(&self, shutdown: &mut watch::Receiver<bool>, attempt: u32) -> bool {
        let delay = self.config.backoff.delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            result = shutdown.changed() => result.is_err() || *shutdown.borrow(),
        }
    }
}

async fn changed_or_pending(watch: Option<Watch>) -> Result<WatchEvent, CoordError> {
    match watch {
        Some(watch) => watch.changed().await,
        None => pending().await,
    }
}
