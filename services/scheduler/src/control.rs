//! Operations for callers outside the reconciliation loop.
//!
//! These are what the HTTP API (or any embedding program) uses to declare
//! services and observe instances. Writes here only touch Service records;
//! the listener turns them into instance changes.

use shepherd_coord::CoordError;
use shepherd_id::{HostId, ServiceId};
use shepherd_reconcile::RunState;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::error::RecordError;
use crate::records::{Host, RecordStore, RunningInstance, Service};

/// Compare-and-set attempts for `stop_service`.
const MAX_CAS_ATTEMPTS: u32 = 5;

pub type ControlResult<T> = Result<T, ControlError>;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("service {0} not found")]
    NotFound(ServiceId),

    /// The service still has instance records.
    #[error("service {service_id} still has {instances} instances")]
    Busy { service_id: ServiceId, instances: usize },

    /// A compare-and-set kept losing to concurrent writers.
    #[error("service {0} is being modified concurrently")]
    Conflict(ServiceId),

    #[error(transparent)]
    Records(#[from] RecordError),
}

impl ControlError {
    fn or_not_found(err: RecordError, service_id: &ServiceId) -> Self {
        if err.is_not_found() {
            Self::NotFound(service_id.clone())
        } else {
            Self::Records(err)
        }
    }
}

/// Create or replace a service record.
#[instrument(skip_all, fields(service_id = %service.id))]
pub async fn update_service(records: &RecordStore, service: &Service) -> ControlResult<()> {
    records.put_service(service).await?;
    info!(
        desired_state = %service.desired_state,
        instances = service.instances,
        "Service updated"
    );
    Ok(())
}

/// Read a service record.
pub async fn get_service(records: &RecordStore, service_id: &ServiceId) -> ControlResult<Service> {
    records
        .get_service(service_id)
        .await
        .map_err(|e| ControlError::or_not_found(e, service_id))
}

/// Every service record, sorted by ID.
pub async fn list_services(records: &RecordStore) -> ControlResult<Vec<Service>> {
    let mut services = Vec::new();
    for service_id in records.service_ids().await? {
        match records.get_service(&service_id).await {
            Ok(service) => services.push(service),
            Err(e) if e.is_not_found() => debug!(%service_id, "Service removed during listing"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(services)
}

/// Set a service's desired state to Stop.
///
/// Only the desired state is changed; every other field is preserved even
/// if another writer updates the record concurrently.
#[instrument(skip(records))]
pub async fn stop_service(records: &RecordStore, service_id: &ServiceId) -> ControlResult<Service> {
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let (mut service, version) = records
            .get_service_versioned(service_id)
            .await
            .map_err(|e| ControlError::or_not_found(e, service_id))?;

        if service.desired_state == RunState::Stop {
            return Ok(service);
        }

        service.desired_state = RunState::Stop;
        match records.set_service(&service, version).await {
            Ok(_) => {
                info!("Service stopped");
                return Ok(service);
            }
            Err(e) if e.is_conflict() => {
                debug!(attempt, "Service changed concurrently, retrying");
            }
            Err(e) => return Err(ControlError::or_not_found(e, service_id)),
        }
    }
    Err(ControlError::Conflict(service_id.clone()))
}

/// Delete a service record that has no instances left.
#[instrument(skip(records))]
pub async fn remove_service(records: &RecordStore, service_id: &ServiceId) -> ControlResult<()> {
    let instances = records
        .instance_ids(service_id)
        .await
        .map_err(|e| ControlError::or_not_found(e, service_id))?;
    if !instances.is_empty() {
        return Err(ControlError::Busy {
            service_id: service_id.clone(),
            instances: instances.len(),
        });
    }

    // A non-recursive delete fails if an instance appeared since the check.
    match records.conn().delete(&crate::paths::service(service_id)).await {
        Ok(()) => {
            info!("Service removed");
            Ok(())
        }
        Err(CoordError::NoNode(_)) => Err(ControlError::NotFound(service_id.clone())),
        Err(CoordError::NotEmpty(_)) => {
            let instances = records
                .instance_ids(service_id)
                .await
                .map(|ids| ids.len())
                .unwrap_or(0);
            Err(ControlError::Busy {
                service_id: service_id.clone(),
                instances,
            })
        }
        Err(e) => Err(RecordError::from(e).into()),
    }
}

/// Instances of every service.
pub async fn load_running_services(records: &RecordStore) -> ControlResult<Vec<RunningInstance>> {
    Ok(records.load_running().await?)
}

/// Instances of one service.
pub async fn load_running_services_by_service(
    records: &RecordStore,
    service_id: &ServiceId,
) -> ControlResult<Vec<RunningInstance>> {
    records
        .load_running_by_service(service_id)
        .await
        .map_err(|e| ControlError::or_not_found(e, service_id))
}

/// Instances assigned to one host. An unknown host has none.
pub async fn load_running_services_by_host(
    records: &RecordStore,
    host_id: &HostId,
) -> ControlResult<Vec<RunningInstance>> {
    Ok(records.load_running_by_host(host_id).await?)
}

/// Make a host eligible for placement while this connection's session lasts.
#[instrument(skip_all, fields(host_id = %host.id))]
pub async fn register_host(records: &RecordStore, host: &Host) -> ControlResult<()> {
    records.register_host(host).await?;
    info!(ip_addr = %host.ip_addr, "Host registered");
    Ok(())
}

/// Hosts currently eligible for placement.
pub async fn load_hosts(records: &RecordStore) -> ControlResult<Vec<Host>> {
    Ok(records.load_hosts().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{HostState, ServiceState};
    use shepherd_coord::{MemoryStore, MemorySession};
    use shepherd_id::InstanceId;
    use std::sync::Arc;

    fn records() -> RecordStore {
        RecordStore::new(Arc::new(MemoryStore::new().session()))
    }

    fn web() -> Service {
        let mut service = Service::new(ServiceId::parse("web").unwrap());
        service.instances = 3;
        service
    }

    #[tokio::test]
    async fn test_stop_service_preserves_other_fields() {
        let records = records();
        let mut service = web();
        service.change_options.push("restartAllOnInstanceChanged".into());
        update_service(&records, &service).await.unwrap();

        let stopped = stop_service(&records, &service.id).await.unwrap();
        assert_eq!(stopped.desired_state, RunState::Stop);
        assert_eq!(stopped.instances, 3);

        let read = get_service(&records, &service.id).await.unwrap();
        assert_eq!(read.change_options, service.change_options);
        assert_eq!(read.desired_state, RunState::Stop);
    }

    #[tokio::test]
    async fn test_stop_service_is_idempotent() {
        let records = records();
        update_service(&records, &web()).await.unwrap();
        stop_service(&records, &web().id).await.unwrap();

        stop_service(&records, &web().id).await.unwrap();
        let (_, version) = records.get_service_versioned(&web().id).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_stop_missing_service() {
        let err = stop_service(&records(), &web().id).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_service_refuses_while_instances_exist() {
        let records = records();
        let service = web();
        update_service(&records, &service).await.unwrap();
        let host = Host {
            id: HostId::parse("host-1").unwrap(),
            ip_addr: "10.0.0.1".into(),
        };
        let state = ServiceState::new(InstanceId::new(), &service, &host, 0);
        records.create_service_state(&state).await.unwrap();
        records
            .create_host_state(&HostState::for_instance(&state))
            .await
            .unwrap();

        let err = remove_service(&records, &service.id).await.unwrap_err();
        assert!(matches!(err, ControlError::Busy { instances: 1, .. }));

        records
            .delete_service_state(&service.id, &state.id)
            .await
            .unwrap();
        remove_service(&records, &service.id).await.unwrap();
        assert!(matches!(
            get_service(&records, &service.id).await.unwrap_err(),
            ControlError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_host_registration_follows_session() {
        let memory = MemoryStore::new();
        let agent: Arc<MemorySession> = Arc::new(memory.session());
        let observer = RecordStore::new(Arc::new(memory.session()));
        let host = Host {
            id: HostId::parse("host-1").unwrap(),
            ip_addr: "10.0.0.1".into(),
        };

        register_host(&RecordStore::new(agent.clone()), &host)
            .await
            .unwrap();
        assert_eq!(load_hosts(&observer).await.unwrap(), vec![host]);

        agent.expire().await;
        assert!(load_hosts(&observer).await.unwrap().is_empty());
    }
}
