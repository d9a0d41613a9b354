//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use shepherd_coord::{
    CoordError, CoordResult, Coordinator, CreateMode, MemorySession, MemoryStore, Node, Watch,
};
use shepherd_id::{HostId, ServiceId};
use shepherd_reconcile::RunState;
use shepherd_scheduler::control;
use shepherd_scheduler::engine::Reconciler;
use shepherd_scheduler::records::{Host, RecordStore, RunningInstance, Service};
use shepherd_scheduler::selector::{HostSelector, LeastLoadedSelector, StaticSelector};

pub struct Harness {
    pub store: MemoryStore,
    pub conn: Arc<dyn Coordinator>,
    pub records: RecordStore,
    pub reconciler: Arc<Reconciler>,
    pub host: Host,
    /// One session per registered host, standing in for its agent.
    pub agents: HashMap<HostId, Arc<MemorySession>>,
}

impl Harness {
    pub async fn new() -> Self {
        let host = host("host-1");
        Self::with_selector(Arc::new(StaticSelector::new(host.clone())), host).await
    }

    /// A harness whose selector places on the given hosts, all registered.
    pub async fn least_loaded(hosts: &[&str]) -> Self {
        let store = MemoryStore::new();
        let conn: Arc<dyn Coordinator> = Arc::new(store.session());
        let records = RecordStore::new(conn.clone());
        let selector = Arc::new(LeastLoadedSelector::new(records.clone()));
        let mut h = Self {
            reconciler: Arc::new(Reconciler::new(conn.clone(), selector)),
            records,
            store,
            conn,
            host: host(hosts[0]),
            agents: HashMap::new(),
        };
        for id in hosts {
            h.register(&host(id)).await;
        }
        h
    }

    pub async fn with_selector(selector: Arc<dyn HostSelector>, host: Host) -> Self {
        let store = MemoryStore::new();
        let conn: Arc<dyn Coordinator> = Arc::new(store.session());
        Self::on_conn(store, conn, selector, host).await
    }

    /// A harness whose reconciler talks to the store through `conn`.
    pub async fn on_conn(
        store: MemoryStore,
        conn: Arc<dyn Coordinator>,
        selector: Arc<dyn HostSelector>,
        host: Host,
    ) -> Self {
        let records = RecordStore::new(Arc::new(store.session()));
        let mut h = Self {
            reconciler: Arc::new(Reconciler::new(conn.clone(), selector)),
            records,
            store,
            conn,
            host: host.clone(),
            agents: HashMap::new(),
        };
        h.register(&host).await;
        h
    }

    /// Register `host` on a session of its own.
    pub async fn register(&mut self, host: &Host) {
        let agent = Arc::new(self.store.session());
        RecordStore::new(agent.clone())
            .register_host(host)
            .await
            .unwrap();
        self.agents.insert(host.id.clone(), agent);
    }

    /// End a host agent's session, as if the host crashed.
    pub async fn crash(&self, host_id: &str) {
        let id = HostId::parse(host_id).unwrap();
        self.agents[&id].expire().await;
    }

    /// Write a service record and return it.
    pub async fn declare(&self, id: &str, state: RunState, instances: u32) -> Service {
        let mut service = Service::new(ServiceId::parse(id).unwrap());
        service.desired_state = state;
        service.instances = instances;
        control::update_service(&self.records, &service).await.unwrap();
        service
    }

    /// Change the instance count and desired state of an existing service.
    pub async fn redeclare(&self, service: &mut Service, state: RunState, instances: u32) {
        service.desired_state = state;
        service.instances = instances;
        control::update_service(&self.records, service).await.unwrap();
    }

    pub async fn running(&self, service: &Service) -> Vec<RunningInstance> {
        self.records
            .load_running_by_service(&service.id)
            .await
            .unwrap()
    }

    /// One listener pass: read, clean, sync.
    pub async fn pass(&self, service: &Service) {
        let service = self.records.get_service(&service.id).await.unwrap();
        let mut instances = self.running(&service).await;
        self.reconciler.clean(&mut instances).await.unwrap();
        self.reconciler.sync(&service, &instances).await.unwrap();
    }
}

pub fn host(id: &str) -> Host {
    Host {
        id: HostId::parse(id).unwrap(),
        ip_addr: "10.0.0.1".to_string(),
    }
}

pub fn indices(instances: &[RunningInstance]) -> Vec<u32> {
    let mut out: Vec<u32> = instances.iter().map(|rs| rs.instance_index).collect();
    out.sort_unstable();
    out
}

/// Indices of instances whose desired state is `state`.
pub fn indices_in(instances: &[RunningInstance], state: RunState) -> Vec<u32> {
    let matching: Vec<RunningInstance> = instances
        .iter()
        .filter(|rs| rs.desired_state == Some(state))
        .cloned()
        .collect();
    indices(&matching)
}

/// Poll the instances of `service` until `check` holds or five seconds pass.
pub async fn wait_for<F>(h: &Harness, service: &Service, what: &str, check: F)
where
    F: Fn(&[RunningInstance]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check(&h.running(service).await) {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A coordinator that fails the next `n` calls with `Unavailable`, and can
/// delete a subtree right before the next `create_child`.
pub struct FlakyCoordinator {
    inner: Arc<dyn Coordinator>,
    failures: AtomicU32,
    delete_before_child: Mutex<Option<String>>,
}

impl FlakyCoordinator {
    pub fn new(inner: Arc<dyn Coordinator>) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            delete_before_child: Mutex::new(None),
        }
    }

    /// Delete `path` and its subtree just before the next `create_child`,
    /// as a concurrent writer would.
    pub fn delete_before_next_child(&self, path: &str) {
        *self.delete_before_child.lock().unwrap() = Some(path.to_string());
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn remaining(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn trip(&self) -> CoordResult<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(CoordError::Unavailable("connection lost".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for FlakyCoordinator {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordResult<String> {
        self.trip()?;
        self.inner.create(path, data, mode).await
    }

    async fn create_child(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordResult<String> {
        self.trip()?;
        let doomed = self.delete_before_child.lock().unwrap().take();
        if let Some(doomed) = doomed {
            self.inner.delete_all(&doomed).await?;
        }
        self.inner.create_child(path, data, mode).await
    }

    async fn get(&self, path: &str) -> CoordResult<Node> {
        self.trip()?;
        self.inner.get(path).await
    }

    async fn get_w(&self, path: &str) -> CoordResult<(Node, Watch)> {
        self.trip()?;
        self.inner.get_w(path).await
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected: Option<u64>) -> CoordResult<u64> {
        self.trip()?;
        self.inner.set(path, data, expected).await
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        self.trip()?;
        self.inner.delete(path).await
    }

    async fn delete_all(&self, path: &str) -> CoordResult<()> {
        self.trip()?;
        self.inner.delete_all(path).await
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        self.trip()?;
        self.inner.exists(path).await
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        self.trip()?;
        self.inner.children(path).await
    }

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        self.trip()?;
        self.inner.children_w(path).await
    }
}
