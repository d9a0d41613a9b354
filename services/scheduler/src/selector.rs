//! Host placement for new instances.

use async_trait::async_trait;
use tracing::debug;

use crate::error::SelectError;
use crate::records::{Host, RecordStore, Service};

/// Picks the host a new instance of a service runs on.
#[async_trait]
pub trait HostSelector: Send + Sync + 'static {
    async fn select_host(&self, service: &Service) -> Result<Host, SelectError>;
}

/// Places on the registered host carrying the fewest instances.
///
/// Ties are broken by host ID so placement is deterministic.
pub struct LeastLoadedSelector {
    records: RecordStore,
}

impl LeastLoadedSelector {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }
}

#[async_trait]
impl HostSelector for LeastLoadedSelector {
    async fn select_host(&self, service: &Service) -> Result<Host, SelectError> {
        let mut best: Option<(usize, Host)> = None;

        // load_hosts returns hosts sorted by ID, so a strict comparison keeps
        // the lowest ID among equally loaded hosts.
        for host in self.records.load_hosts().await? {
            let load = self.records.host_instance_count(&host.id).await?;
            let better = match &best {
                Some((best_load, _)) => load < *best_load,
                None => true,
            };
            if better {
                best = Some((load, host));
            }
        }

        match best {
            Some((load, host)) => {
                debug!(service_id = %service.id, host_id = %host.id, load, "Selected host");
                Ok(host)
            }
            None => Err(SelectError::NoEligibleHosts(service.id.clone())),
        }
    }
}

/// Always answers with the same host, or with no host at all.
#[derive(Debug, Clone)]
pub struct StaticSelector {
    host: Option<Host>,
}

impl StaticSelector {
    pub fn new(host: Host) -> Self {
        Self { host: Some(host) }
    }

    /// A selector that never finds a host.
    pub fn unavailable() -> Self {
        Self { host: None }
    }
}

#[async_trait]
impl HostSelector for StaticSelector {
    async fn select_host(&self, service: &Service) -> Result<Host, SelectError> {
        self.host
            .clone()
            .ok_or_else(|| SelectError::NoEligibleHosts(service.id.clone()))
    }
}
