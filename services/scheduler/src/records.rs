//! Records kept in the coordination store and the typed accessors over them.
//!
//! Every record is a JSON document stored as a node's payload. The
//! Service-Instance record and the Host-Instance record of one instance are
//! the two halves of a pair: the first says what the scheduler placed, the
//! second is what the host agent acts on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shepherd_coord::{CoordError, Coordinator, CreateMode, Node};
use shepherd_id::{HostId, InstanceId, ServiceId};
use shepherd_reconcile::{RunState, Target};
use tracing::{debug, warn};

use crate::error::{RecordError, RecordResult};
use crate::paths;

/// Change option that holds scale-up back until every instance is gone.
pub const RESTART_ALL_ON_INSTANCE_CHANGED: &str = "restartAllOnInstanceChanged";

/// Placeholder in an endpoint's application name replaced by the instance
/// index.
pub const INSTANCE_PLACEHOLDER: &str = "{{instance}}";

// =============================================================================
// Service
// =============================================================================

/// The declared definition of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,

    #[serde(default)]
    pub name: String,

    pub desired_state: RunState,

    /// Declared instance count.
    pub instances: u32,

    #[serde(default)]
    pub change_options: Vec<String>,

    #[serde(default)]
    pub endpoints: Vec<ServiceEndpoint>,
}

impl Service {
    /// A running service with no instances.
    pub fn new(id: ServiceId) -> Self {
        Self {
            name: id.to_string(),
            id,
            desired_state: RunState::Run,
            instances: 0,
            change_options: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn has_change_option(&self, option: &str) -> bool {
        self.change_options.iter().any(|o| o == option)
    }

    /// Returns true if scale-up must wait for every instance to be gone.
    pub fn restart_all_on_instance_change(&self) -> bool {
        self.has_change_option(RESTART_ALL_ON_INSTANCE_CHANGED)
    }

    /// The planner's view of this service.
    pub fn target(&self) -> Target {
        Target {
            state: self.desired_state,
            count: self.instances,
            restart_all: self.restart_all_on_instance_change(),
        }
    }
}

/// An endpoint declared on a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,

    /// Application name; may contain [`INSTANCE_PLACEHOLDER`].
    pub application: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    pub port_number: u16,

    /// `export` or `import`.
    #[serde(default = "default_purpose")]
    pub purpose: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

fn default_purpose() -> String {
    "export".to_string()
}

impl ServiceEndpoint {
    /// The endpoint as bound to the instance at `index`.
    pub fn for_instance(&self, index: u32) -> InstanceEndpoint {
        InstanceEndpoint {
            name: self.name.clone(),
            application: self
                .application
                .replace(INSTANCE_PLACEHOLDER, &index.to_string()),
            protocol: self.protocol.clone(),
            container_port: self.port_number,
            host_port: None,
            purpose: self.purpose.clone(),
        }
    }
}

/// An endpoint bound to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEndpoint {
    pub name: String,
    pub application: String,
    pub protocol: String,
    pub container_port: u16,

    /// Filled in by the host agent once the port is bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    pub purpose: String,
}

// =============================================================================
// Instance records
// =============================================================================

/// Service-Instance record: one placed instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub host_id: HostId,
    pub host_ip: String,
    pub instance_index: u32,

    #[serde(default)]
    pub endpoints: Vec<InstanceEndpoint>,

    pub created_at: DateTime<Utc>,
}

impl ServiceState {
    /// A fresh record for `service` at `index` placed on `host`.
    pub fn new(id: InstanceId, service: &Service, host: &Host, index: u32) -> Self {
        Self {
            id,
            service_id: service.id.clone(),
            host_id: host.id.clone(),
            host_ip: host.ip_addr.clone(),
            instance_index: index,
            endpoints: service
                .endpoints
                .iter()
                .map(|ep| ep.for_instance(index))
                .collect(),
            created_at: Utc::now(),
        }
    }
}

/// Host-Instance record: what the host agent should do with an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub service_state_id: InstanceId,
    pub desired_state: RunState,
}

impl HostState {
    /// The host half of `state`, asked to run.
    pub fn for_instance(state: &ServiceState) -> Self {
        Self {
            host_id: state.host_id.clone(),
            service_id: state.service_id.clone(),
            service_state_id: state.id,
            desired_state: RunState::Run,
        }
    }
}

/// Joined view of an instance used for planning and by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningInstance {
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub service_name: String,
    pub host_id: HostId,
    pub host_ip: String,
    pub instance_index: u32,

    /// `None` when the Host-Instance record is missing.
    pub desired_state: Option<RunState>,

    pub created_at: DateTime<Utc>,
}

impl RunningInstance {
    fn join(service_name: &str, state: ServiceState, host: Option<&HostState>) -> Self {
        Self {
            id: state.id,
            service_id: state.service_id,
            service_name: service_name.to_string(),
            host_id: state.host_id,
            host_ip: state.host_ip,
            instance_index: state.instance_index,
            desired_state: host.map(|h| h.desired_state),
            created_at: state.created_at,
        }
    }

    /// Returns true if the Host-Instance record is gone.
    pub fn is_orphaned(&self) -> bool {
        self.desired_state.is_none()
    }
}

/// A host eligible for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub ip_addr: String,
}

// =============================================================================
// RecordStore
// =============================================================================

/// Typed reads and writes over the coordination store.
#[derive(Clone)]
pub struct RecordStore {
    conn: Arc<dyn Coordinator>,
}

impl RecordStore {
    pub fn new(conn: Arc<dyn Coordinator>) -> Self {
        Self { conn }
    }

    /// The underlying connection.
    pub fn conn(&self) -> &Arc<dyn Coordinator> {
        &self.conn
    }

    // -------------------------------------------------------------------------
    // Generic helpers
    // -------------------------------------------------------------------------

    async fn read<T: DeserializeOwned>(&self, path: &str) -> RecordResult<(T, u64)> {
        let node = self.conn.get(path).await?;
        let value = decode(path, &node)?;
        Ok((value, node.version))
    }

    async fn read_opt<T: DeserializeOwned>(&self, path: &str) -> RecordResult<Option<(T, u64)>> {
        match self.read(path).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        mode: CreateMode,
    ) -> RecordResult<()> {
        self.conn.create(path, encode(value)?, mode).await?;
        Ok(())
    }

    async fn write<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected: Option<u64>,
    ) -> RecordResult<u64> {
        Ok(self.conn.set(path, encode(value)?, expected).await?)
    }

    /// Delete a leaf node; returns false if it was already gone.
    async fn remove(&self, path: &str) -> RecordResult<bool> {
        match self.conn.delete(path).await {
            Ok(()) => Ok(true),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Child names of `path`, or empty if `path` does not exist.
    async fn children_or_empty(&self, path: &str) -> RecordResult<Vec<String>> {
        match self.conn.children(path).await {
            Ok(children) => Ok(children),
            Err(CoordError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Services
    // -------------------------------------------------------------------------

    pub async fn get_service(&self, id: &ServiceId) -> RecordResult<Service> {
        self.read(&paths::service(id)).await.map(|(s, _)| s)
    }

    /// Read a service together with its data version.
    pub async fn get_service_versioned(&self, id: &ServiceId) -> RecordResult<(Service, u64)> {
        self.read(&paths::service(id)).await
    }

    /// Create or overwrite a service record.
    pub async fn put_service(&self, service: &Service) -> RecordResult<()> {
        let path = paths::service(&service.id);
        match self.create(&path, service, CreateMode::Persistent).await {
            Err(RecordError::Coord(CoordError::NodeExists(_))) => {
                self.write(&path, service, None).await.map(|_| ())
            }
            other => other,
        }
    }

    /// Compare-and-set a service record.
    pub async fn set_service(&self, service: &Service, expected: u64) -> RecordResult<u64> {
        self.write(&paths::service(&service.id), service, Some(expected))
            .await
    }

    /// IDs of all services, sorted.
    pub async fn service_ids(&self) -> RecordResult<Vec<ServiceId>> {
        let children = self.children_or_empty(paths::SERVICES).await?;
        Ok(parse_children(paths::SERVICES, children))
    }

    /// IDs of the instances recorded under a service.
    pub async fn instance_ids(&self, service_id: &ServiceId) -> RecordResult<Vec<InstanceId>> {
        let path = paths::service(service_id);
        let children = self.conn.children(&path).await?;
        Ok(parse_children(&path, children))
    }

    // -------------------------------------------------------------------------
    // Service-Instance records
    // -------------------------------------------------------------------------

    pub async fn get_service_state(
        &self,
        service_id: &ServiceId,
        instance_id: &InstanceId,
    ) -> RecordResult<ServiceState> {
        self.read(&paths::service_instance(service_id, instance_id))
            .await
            .map(|(s, _)| s)
    }

    /// Create a Service-Instance record under its service.
    ///
    /// Fails with `NoNode` when the service node is gone; the record is
    /// never written under a service that no longer exists.
    pub async fn create_service_state(&self, state: &ServiceState) -> RecordResult<()> {
        let path = paths::service_instance(&state.service_id, &state.id);
        self.conn
            .create_child(&path, encode(state)?, CreateMode::Persistent)
            .await?;
        Ok(())
    }

    /// Returns false if the record was already gone.
    pub async fn delete_service_state(
        &self,
        service_id: &ServiceId,
        instance_id: &InstanceId,
    ) -> RecordResult<bool> {
        self.remove(&paths::service_instance(service_id, instance_id))
            .await
    }

    // -------------------------------------------------------------------------
    // Host-Instance records
    // -------------------------------------------------------------------------

    /// Read a Host-Instance record and its version, if present.
    pub async fn find_host_state(
        &self,
        host_id: &HostId,
        instance_id: &InstanceId,
    ) -> RecordResult<Option<(HostState, u64)>> {
        self.read_opt(&paths::host_instance(host_id, instance_id))
            .await
    }

    pub async fn host_state_exists(
        &self,
        host_id: &HostId,
        instance_id: &InstanceId,
    ) -> RecordResult<bool> {
        Ok(self
            .conn
            .exists(&paths::host_instance(host_id, instance_id))
            .await?)
    }

    pub async fn create_host_state(&self, state: &HostState) -> RecordResult<()> {
        let path = paths::host_instance(&state.host_id, &state.service_state_id);
        self.create(&path, state, CreateMode::Persistent).await
    }

    /// Compare-and-set a Host-Instance record.
    pub async fn set_host_state(&self, state: &HostState, expected: u64) -> RecordResult<u64> {
        let path = paths::host_instance(&state.host_id, &state.service_state_id);
        self.write(&path, state, Some(expected)).await
    }

    /// Returns false if the record was already gone.
    pub async fn delete_host_state(
        &self,
        host_id: &HostId,
        instance_id: &InstanceId,
    ) -> RecordResult<bool> {
        self.remove(&paths::host_instance(host_id, instance_id)).await
    }

    /// Number of Host-Instance records under a host.
    pub async fn host_instance_count(&self, host_id: &HostId) -> RecordResult<usize> {
        Ok(self.children_or_empty(&paths::host(host_id)).await?.len())
    }

    // -------------------------------------------------------------------------
    // Hosts
    // -------------------------------------------------------------------------

    /// Register a host for the lifetime of this connection's session.
    pub async fn register_host(&self, host: &Host) -> RecordResult<()> {
        let path = paths::registered_host(&host.id);
        match self.create(&path, host, CreateMode::Ephemeral).await {
            Err(RecordError::Coord(CoordError::NodeExists(_))) => {
                self.write(&path, host, None).await.map(|_| ())
            }
            other => other,
        }
    }

    /// IDs of the hosts currently registered.
    pub async fn registered_host_ids(&self) -> RecordResult<HashSet<HostId>> {
        let names = self.children_or_empty(paths::HOST_REGISTRY).await?;
        Ok(parse_children(paths::HOST_REGISTRY, names)
            .into_iter()
            .collect())
    }

    /// Whether `host_id` holds a live registration.
    pub async fn host_registered(&self, host_id: &HostId) -> RecordResult<bool> {
        Ok(self.conn.exists(&paths::registered_host(host_id)).await?)
    }

    /// Registered hosts, sorted by ID.
    pub async fn load_hosts(&self) -> RecordResult<Vec<Host>> {
        let mut hosts = Vec::new();
        for name in self.children_or_empty(paths::HOST_REGISTRY).await? {
            let path = shepherd_coord::path::join(paths::HOST_REGISTRY, [&name]);
            match self.read_opt::<Host>(&path).await? {
                Some((host, _)) => hosts.push(host),
                None => debug!(host = %name, "Host deregistered during listing"),
            }
        }
        Ok(hosts)
    }

    // -------------------------------------------------------------------------
    // Running-instance views
    // -------------------------------------------------------------------------

    /// Instances of one service, sorted by index.
    ///
    /// Instances whose Host-Instance record is missing are included with no
    /// desired state. Fails with `NoNode` if the service does not exist.
    pub async fn load_running_by_service(
        &self,
        service_id: &ServiceId,
    ) -> RecordResult<Vec<RunningInstance>> {
        let service = self.get_service(service_id).await?;
        let mut out = Vec::new();
        for instance_id in self.instance_ids(service_id).await? {
            let state = match self.get_service_state(service_id, &instance_id).await {
                Ok(state) => state,
                Err(e) if e.is_not_found() => {
                    debug!(%instance_id, "Instance removed during listing");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let host = self.find_host_state(&state.host_id, &instance_id).await?;
            out.push(RunningInstance::join(
                &service.name,
                state,
                host.as_ref().map(|(h, _)| h),
            ));
        }
        out.sort_by(|a, b| {
            a.instance_index
                .cmp(&b.instance_index)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    /// Instances assigned to a host, sorted by service then index.
    ///
    /// Host-Instance records without a matching Service-Instance record are
    /// skipped.
    pub async fn load_running_by_host(
        &self,
        host_id: &HostId,
    ) -> RecordResult<Vec<RunningInstance>> {
        let host_path = paths::host(host_id);
        let names = self.children_or_empty(&host_path).await?;
        let mut service_names: HashMap<ServiceId, String> = HashMap::new();
        let mut out = Vec::new();

        for instance_id in parse_children::<InstanceId>(&host_path, names) {
            let Some((host_state, _)) = self.find_host_state(host_id, &instance_id).await? else {
                continue;
            };
            let service_id = host_state.service_id.clone();
            let state = match self.get_service_state(&service_id, &instance_id).await {
                Ok(state) => state,
                Err(e) if e.is_not_found() => {
                    debug!(
                        %instance_id,
                        %service_id,
                        "Skipping host record with no service record"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            let service_name = match service_names.get(&service_id) {
                Some(name) => name.clone(),
                None => {
                    let name = match self.get_service(&service_id).await {
                        Ok(service) => service.name,
                        Err(e) if e.is_not_found() => service_id.to_string(),
                        Err(e) => return Err(e),
                    };
                    service_names.insert(service_id.clone(), name.clone());
                    name
                }
            };
            out.push(RunningInstance::join(&service_name, state, Some(&host_state)));
        }

        out.sort_by(|a, b| {
            (&a.service_id, a.instance_index, &a.id).cmp(&(&b.service_id, b.instance_index, &b.id))
        });
        Ok(out)
    }

    /// Instances of every service, sorted by service then index.
    ///
    /// A service whose record cannot be decoded is left out of the listing.
    pub async fn load_running(&self) -> RecordResult<Vec<RunningInstance>> {
        let mut out = Vec::new();
        for service_id in self.service_ids().await? {
            match self.load_running_by_service(&service_id).await {
                Ok(instances) => out.extend(instances),
                Err(e) if e.is_not_found() => {
                    debug!(%service_id, "Service removed during listing");
                }
                Err(e @ RecordError::Decode { .. }) => {
                    warn!(%service_id, error = %e, "Skipping unreadable service");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Decode a record payload.
pub fn decode<T: DeserializeOwned>(path: &str, node: &Node) -> RecordResult<T> {
    serde_json::from_slice(&node.data).map_err(|source| RecordError::Decode {
        path: path.to_string(),
        source,
    })
}

fn encode<T: Serialize>(value: &T) -> RecordResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(RecordError::Encode)
}

/// Parse child names, skipping any that are not valid IDs.
fn parse_children<T: std::str::FromStr>(parent: &str, names: Vec<String>) -> Vec<T> {
    names
        .into_iter()
        .filter_map(|name| match name.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(parent, child = %name, "Ignoring unrecognised child node");
                None
            }
        })
        .collect()
}
