//! Reconciliation engine.
//!
//! The [`Reconciler`] compares a service's declared state with the instance
//! records in the coordination store and writes the records needed to close
//! the gap:
//! - `start` places new instances and writes their record pairs
//! - `stop` / `pause` / `resume` rewrite the desired state on host records
//! - `remove_instance` deletes a record pair
//! - `clean` deletes instances whose host record or host has vanished
//!
//! Every write touching an instance happens under that instance's lock.
//! Per-instance failures are logged and collected; one bad instance never
//! prevents the rest of a batch from being processed.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use shepherd_coord::Coordinator;
use shepherd_id::{Generator, HostId, InstanceId, ServiceId};
use shepherd_reconcile::{plan_sync, Member, RunState};
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, EngineResult};
use crate::lock::with_instance_lock;
use crate::records::{HostState, RecordStore, RunningInstance, Service, ServiceState};
use crate::selector::HostSelector;

/// Compare-and-set attempts on a host record before giving up.
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Drives instance records toward a service's declared state.
pub struct Reconciler {
    records: RecordStore,
    selector: Arc<dyn HostSelector>,
}

impl Reconciler {
    pub fn new(conn: Arc<dyn Coordinator>, selector: Arc<dyn HostSelector>) -> Self {
        Self {
            records: RecordStore::new(conn),
            selector,
        }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    fn conn(&self) -> Arc<dyn Coordinator> {
        Arc::clone(self.records.conn())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Bring the instance set of `service` in line with its declaration.
    ///
    /// `instances` is the service's current instance set, as returned by
    /// [`RecordStore::load_running_by_service`] and filtered by
    /// [`Reconciler::clean`]. Instances with no host record are treated as
    /// stopping: they keep their index but do not count toward the total.
    #[instrument(skip_all, fields(service_id = %service.id))]
    pub async fn sync(&self, service: &Service, instances: &[RunningInstance]) -> EngineResult<()> {
        let members: Vec<Member<usize>> = instances
            .iter()
            .enumerate()
            .map(|(key, rs)| Member {
                key,
                index: rs.instance_index,
                state: rs.desired_state.unwrap_or(RunState::Stop),
            })
            .collect();

        let plan = plan_sync(&service.target(), &members);
        if plan.deferred {
            info!(
                instances = instances.len(),
                "Scale-up deferred until all instances have stopped"
            );
        }
        if plan.is_empty() {
            debug!(instances = instances.len(), "Service in sync");
            return Ok(());
        }

        info!(
            desired = service.target().desired_count(),
            start = plan.start.len(),
            stop = plan.stop.len(),
            pause = plan.pause.len(),
            resume = plan.resume.len(),
            "Applying sync plan"
        );

        let pick = |keys: &[usize]| -> Vec<RunningInstance> {
            keys.iter().map(|&k| instances[k].clone()).collect()
        };

        let mut errors = Vec::new();
        if !plan.resume.is_empty() {
            if let Err(e) = self.resume(&pick(&plan.resume)).await {
                errors.push(e);
            }
        }
        if !plan.stop.is_empty() {
            if let Err(e) = self.stop(&pick(&plan.stop)).await {
                errors.push(e);
            }
        }
        if !plan.pause.is_empty() {
            if let Err(e) = self.pause(&pick(&plan.pause)).await {
                errors.push(e);
            }
        }
        if !plan.start.is_empty() {
            if let Err(e) = self.start(service, &plan.start).await {
                errors.push(e);
            }
        }
        EngineError::collect(errors)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Start one new instance of `service` at each of `indices`.
    ///
    /// Placements run one after another so each selection sees the records
    /// written by the previous one. A failed placement is logged and the
    /// remaining indices are still attempted.
    #[instrument(skip_all, fields(service_id = %service.id, count = indices.len()))]
    pub async fn start(&self, service: &Service, indices: &[u32]) -> EngineResult<()> {
        let mut generator = Generator::new();
        let mut errors = Vec::new();

        for &index in indices {
            let id = generator
                .generate()
                .map(InstanceId::from_ulid)
                .unwrap_or_else(|_| InstanceId::new());

            if let Err(e) = self.start_instance(service, index, id).await {
                warn!(instance_index = index, error = %e, "Failed to start instance");
                errors.push(e);
            }
        }
        EngineError::collect(errors)
    }

    async fn start_instance(
        &self,
        service: &Service,
        index: u32,
        id: InstanceId,
    ) -> EngineResult<()> {
        let host = self.selector.select_host(service).await?;
        let state = ServiceState::new(id, service, &host, index);
        let host_state = HostState::for_instance(&state);

        with_instance_lock(self.conn(), id, self.write_pair(&state, &host_state)).await?;

        info!(
            instance_id = %id,
            instance_index = index,
            host_id = %host.id,
            "Started instance"
        );
        Ok(())
    }

    /// Write the Service-Instance record, then the Host-Instance record.
    ///
    /// The first write fails if the service was deleted. If the second write
    /// fails the first is rolled back; an instance whose rollback also fails
    /// is left for `clean` to remove.
    async fn write_pair(&self, state: &ServiceState, host_state: &HostState) -> EngineResult<()> {
        match self.records.create_service_state(state).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                return Err(EngineError::ServiceGone(state.service_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.records.create_host_state(host_state).await {
            if let Err(rollback) = self
                .records
                .delete_service_state(&state.service_id, &state.id)
                .await
            {
                warn!(
                    instance_id = %state.id,
                    error = %rollback,
                    "Failed to roll back service record"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    // =========================================================================
    // Desired-state changes
    // =========================================================================

    /// Ask the hosts of `instances` to stop them.
    #[instrument(skip_all, fields(count = instances.len()))]
    pub async fn stop(&self, instances: &[RunningInstance]) -> EngineResult<()> {
        self.set_desired_state(instances, RunState::Stop).await
    }

    /// Ask the hosts of `instances` to pause them.
    #[instrument(skip_all, fields(count = instances.len()))]
    pub async fn pause(&self, instances: &[RunningInstance]) -> EngineResult<()> {
        self.set_desired_state(instances, RunState::Pause).await
    }

    /// Ask the hosts of `instances` to run them again.
    #[instrument(skip_all, fields(count = instances.len()))]
    pub async fn resume(&self, instances: &[RunningInstance]) -> EngineResult<()> {
        self.set_desired_state(instances, RunState::Run).await
    }

    async fn set_desired_state(
        &self,
        instances: &[RunningInstance],
        state: RunState,
    ) -> EngineResult<()> {
        let results = join_all(instances.iter().map(|rs| {
            with_instance_lock(self.conn(), rs.id, self.write_desired_state(rs, state))
        }))
        .await;

        let mut errors = Vec::new();
        for (rs, result) in instances.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    instance_id = %rs.id,
                    desired_state = %state,
                    error = %e,
                    "Failed to update instance"
                );
                errors.push(e);
            }
        }
        EngineError::collect(errors)
    }

    /// Rewrite the host record's desired state. A missing host record means
    /// there is nothing to tell the host, so it is not an error.
    async fn write_desired_state(&self, rs: &RunningInstance, state: RunState) -> EngineResult<()> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some((mut host_state, version)) =
                self.records.find_host_state(&rs.host_id, &rs.id).await?
            else {
                debug!(instance_id = %rs.id, "Host record gone, nothing to update");
                return Ok(());
            };
            if host_state.desired_state == state {
                return Ok(());
            }

            host_state.desired_state = state;
            match self.records.set_host_state(&host_state, version).await {
                Ok(_) => {
                    debug!(instance_id = %rs.id, desired_state = %state, "Updated instance");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        warn!(instance_id = %rs.id, "Gave up updating host record after repeated conflicts");
        Err(EngineError::Contended(rs.id))
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Delete an instance's host record and service record.
    ///
    /// Absent records are skipped, so removing an instance twice is a no-op.
    #[instrument(skip(self))]
    pub async fn remove_instance(
        &self,
        service_id: &ServiceId,
        host_id: &HostId,
        instance_id: InstanceId,
    ) -> EngineResult<()> {
        with_instance_lock(
            self.conn(),
            instance_id,
            self.delete_pair(service_id, host_id, instance_id),
        )
        .await
    }

    async fn delete_pair(
        &self,
        service_id: &ServiceId,
        host_id: &HostId,
        instance_id: InstanceId,
    ) -> EngineResult<()> {
        let host_removed = self.records.delete_host_state(host_id, &instance_id).await?;
        let service_removed = self
            .records
            .delete_service_state(service_id, &instance_id)
            .await?;
        if host_removed || service_removed {
            info!(%instance_id, %host_id, "Removed instance");
        }
        Ok(())
    }

    /// Remove orphaned instances: those whose host record no longer exists
    /// or whose host is no longer registered.
    ///
    /// A host's registration is ephemeral, so a crashed host drops out of
    /// the registry and everything placed on it is removed here. Removed
    /// instances are dropped from `instances`; the number removed is
    /// returned. Both checks are repeated under the instance lock before
    /// anything is deleted.
    #[instrument(skip_all)]
    pub async fn clean(&self, instances: &mut Vec<RunningInstance>) -> EngineResult<usize> {
        if instances.is_empty() {
            return Ok(0);
        }
        let live = self.records.registered_host_ids().await?;
        let results = join_all(
            instances
                .iter()
                .map(|rs| self.clean_instance(rs, live.contains(&rs.host_id))),
        )
        .await;

        let mut removed = HashSet::new();
        let mut errors = Vec::new();
        for (rs, result) in instances.iter().zip(results) {
            match result {
                Ok(true) => {
                    removed.insert(rs.id);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(instance_id = %rs.id, error = %e, "Failed to clean instance");
                    errors.push(e);
                }
            }
        }

        instances.retain(|rs| !removed.contains(&rs.id));
        if !removed.is_empty() {
            info!(removed = removed.len(), "Cleaned orphaned instances");
        }
        EngineError::collect(errors).map(|()| removed.len())
    }

    async fn clean_instance(&self, rs: &RunningInstance, host_live: bool) -> EngineResult<bool> {
        if host_live && self.records.host_state_exists(&rs.host_id, &rs.id).await? {
            return Ok(false);
        }

        with_instance_lock(self.conn(), rs.id, self.remove_if_orphaned(rs)).await
    }

    async fn remove_if_orphaned(&self, rs: &RunningInstance) -> EngineResult<bool> {
        let reason = if !self.records.host_registered(&rs.host_id).await? {
            "host deregistered"
        } else if !self.records.host_state_exists(&rs.host_id, &rs.id).await? {
            "host record missing"
        } else {
            return Ok(false);
        };
        info!(
            instance_id = %rs.id,
            instance_index = rs.instance_index,
            host_id = %rs.host_id,
            reason,
            "Removing orphaned instance"
        );
        self.delete_pair(&rs.service_id, &rs.host_id, rs.id).await?;
        Ok(true)
    }
}
