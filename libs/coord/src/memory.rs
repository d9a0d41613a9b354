//! In-process coordination store backend.
//!
//! A single [`MemoryStore`] holds the node tree; every [`MemorySession`]
//! opened on it behaves like an independent client connection with its own
//! session, so ephemeral nodes and locks can be tied to (and released with)
//! a particular session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use shepherd_id::SessionId;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::path::{self, ROOT};
use crate::watch::{EventKind, Watch, WatchEvent};
use crate::{CoordError, CoordResult, Coordinator, CreateMode, Node};

/// Shared in-memory node tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    /// Create an empty store containing only the root node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session on this store.
    pub fn session(&self) -> MemorySession {
        let id = SessionId::new();
        debug!(session_id = %id, "Opened coordination session");
        MemorySession {
            id,
            tree: Arc::clone(&self.tree),
        }
    }
}

/// A client session on a [`MemoryStore`].
pub struct MemorySession {
    id: SessionId,
    tree: Arc<Mutex<Tree>>,
}

impl MemorySession {
    /// The session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// End the session: its ephemeral nodes are deleted (firing watches) and
    /// every later call on it fails with [`CoordError::SessionExpired`].
    pub async fn expire(&self) {
        let mut tree = self.tree.lock().await;
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, entry)| entry.owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            tree.remove_node(path);
        }
        tree.expired.insert(self.id);
        debug!(
            session_id = %self.id,
            ephemeral_removed = owned.len(),
            "Coordination session expired"
        );
    }
}

// =============================================================================
// Tree
// =============================================================================

type Watchers = HashMap<String, Vec<oneshot::Sender<WatchEvent>>>;

struct Entry {
    data: Vec<u8>,
    version: u64,
    owner: Option<SessionId>,
    sequence: u64,
}

impl Entry {
    fn persistent(data: Vec<u8>) -> Self {
        Self {
            data,
            version: 0,
            owner: None,
            sequence: 0,
        }
    }
}

struct Tree {
    nodes: BTreeMap<String, Entry>,
    data_watches: Watchers,
    child_watches: Watchers,
    expired: HashSet<SessionId>,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT.to_string(), Entry::persistent(Vec::new()));
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            expired: HashSet::new(),
        }
    }
}

impl Tree {
    fn check_session(&self, id: SessionId) -> CoordResult<()> {
        if self.expired.contains(&id) {
            return Err(CoordError::SessionExpired);
        }
        Ok(())
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = path::child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = path::child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(k, _)| k.starts_with(&prefix))
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = path::child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(watchers: &mut Watchers, path: &str, kind: EventKind) {
        if let Some(senders) = watchers.remove(path) {
            for tx in senders {
                let _ = tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    fn watch(watchers: &mut Watchers, path: &str) -> Watch {
        let (tx, watch) = Watch::channel();
        let senders = watchers.entry(path.to_string()).or_default();
        senders.retain(|s| !s.is_closed());
        senders.push(tx);
        watch
    }

    fn insert_node(&mut self, path: &str, entry: Entry) {
        self.nodes.insert(path.to_string(), entry);
        Self::fire(&mut self.data_watches, path, EventKind::Created);
        if let Some(parent) = path::parent(path) {
            Self::fire(&mut self.child_watches, parent, EventKind::ChildrenChanged);
        }
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        Self::fire(&mut self.data_watches, path, EventKind::Deleted);
        Self::fire(&mut self.child_watches, path, EventKind::Deleted);
        if let Some(parent) = path::parent(path) {
            Self::fire(&mut self.child_watches, parent, EventKind::ChildrenChanged);
        }
    }

    fn ensure_ancestors(&mut self, parent: &str) -> CoordResult<()> {
        let mut missing = Vec::new();
        let mut cursor = Some(parent);
        while let Some(p) = cursor {
            match self.nodes.get(p) {
                Some(entry) if entry.owner.is_some() => {
                    return Err(CoordError::NoChildrenForEphemerals(p.to_string()));
                }
                Some(_) => break,
                None => missing.push(p.to_string()),
            }
            cursor = path::parent(p);
        }
        for p in missing.iter().rev() {
            self.insert_node(p, Entry::persistent(Vec::new()));
        }
        Ok(())
    }

    fn create(
        &mut self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
        make_parents: bool,
    ) -> CoordResult<String> {
        path::validate(path)?;
        let Some(parent) = path::parent(path) else {
            return Err(CoordError::NodeExists(path.to_string()));
        };
        if make_parents {
            self.ensure_ancestors(parent)?;
        } else {
            match self.nodes.get(parent) {
                None => return Err(CoordError::NoNode(parent.to_string())),
                Some(entry) if entry.owner.is_some() => {
                    return Err(CoordError::NoChildrenForEphemerals(parent.to_string()));
                }
                Some(_) => {}
            }
        }

        let actual = if mode.is_sequential() {
            let parent_entry = self
                .nodes
                .get_mut(parent)
                .ok_or_else(|| CoordError::NoNode(parent.to_string()))?;
            let seq = parent_entry.sequence;
            parent_entry.sequence += 1;
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }

        let entry = Entry {
            owner: mode.is_ephemeral().then_some(session),
            ..Entry::persistent(data)
        };
        self.insert_node(&actual, entry);
        Ok(actual)
    }

    fn get(&self, path: &str) -> CoordResult<Node> {
        path::validate(path)?;
        self.nodes
            .get(path)
            .map(|entry| Node {
                data: entry.data.clone(),
                version: entry.version,
            })
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    fn set(&mut self, path: &str, data: Vec<u8>, expected: Option<u64>) -> CoordResult<u64> {
        path::validate(path)?;
        let entry = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
        if let Some(expected) = expected {
            if entry.version != expected {
                return Err(CoordError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: entry.version,
                });
            }
        }
        entry.data = data;
        entry.version += 1;
        let version = entry.version;
        Self::fire(&mut self.data_watches, path, EventKind::DataChanged);
        Ok(version)
    }

    fn delete(&mut self, path: &str, recursive: bool) -> CoordResult<()> {
        path::validate(path)?;
        if path == ROOT {
            return Err(CoordError::InvalidPath {
                path: path.to_string(),
                reason: "cannot delete the root",
            });
        }
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        if recursive {
            // Descendants sort after their ancestors; remove deepest first.
            for descendant in self.descendants(path).iter().rev() {
                self.remove_node(descendant);
            }
        } else if self.has_children(path) {
            return Err(CoordError::NotEmpty(path.to_string()));
        }
        self.remove_node(path);
        Ok(())
    }

    fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        path::validate(path)?;
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }
        Ok(self.child_names(path))
    }
}

// =============================================================================
// Coordinator
// =============================================================================

#[async_trait]
impl Coordinator for MemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> CoordResult<String> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.create(self.id, path, data, mode, true)
    }

    async fn create_child(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordResult<String> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.create(self.id, path, data, mode, false)
    }

    async fn get(&self, path: &str) -> CoordResult<Node> {
        let tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.get(path)
    }

    async fn get_w(&self, path: &str) -> CoordResult<(Node, Watch)> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        let node = tree.get(path)?;
        let watch = Tree::watch(&mut tree.data_watches, path);
        Ok((node, watch))
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected: Option<u64>) -> CoordResult<u64> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.set(path, data, expected)
    }

    async fn delete(&self, path: &str) -> CoordResult<()> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.delete(path, false)
    }

    async fn delete_all(&self, path: &str) -> CoordResult<()> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.delete(path, true)
    }

    async fn exists(&self, path: &str) -> CoordResult<bool> {
        path::validate(path)?;
        let tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        Ok(tree.nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        let tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        tree.children(path)
    }

    async fn children_w(&self, path: &str) -> CoordResult<(Vec<String>, Watch)> {
        let mut tree = self.tree.lock().await;
        tree.check_session(self.id)?;
        let children = tree.children(path)?;
        let watch = Tree::watch(&mut tree.child_watches, path);
        Ok((children, watch))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn conn() -> (MemoryStore, MemorySession) {
        let store = MemoryStore::new();
        let session = store.session();
        (store, session)
    }

    #[tokio::test]
    async fn test_create_makes_parents() {
        let (_store, conn) = conn();
        conn.create("/services/web/inst_1", b"x".to_vec(), CreateMode::Persistent)
            .await
            .unwrap();

        assert!(conn.exists("/services").await.unwrap());
        assert_eq!(conn.children("/services").await.unwrap(), vec!["web"]);
        assert_eq!(conn.get("/services/web/inst_1").await.unwrap().data, b"x");
    }

    #[tokio::test]
    async fn test_create_child_needs_parent() {
        let (_store, conn) = conn();
        let err = conn
            .create_child("/services/web/inst_1", vec![], CreateMode::Persistent)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoNode("/services/web".to_string()));
        assert!(!conn.exists("/services").await.unwrap());

        conn.create("/services/web", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        conn.create_child("/services/web/inst_1", vec![], CreateMode::Persistent)
            .await
            .unwrap();
        assert_eq!(conn.children("/services/web").await.unwrap(), vec!["inst_1"]);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let (_store, conn) = conn();
        conn.create("/a", vec![], CreateMode::Persistent).await.unwrap();
        let err = conn.create("/a", vec![], CreateMode::Persistent).await.unwrap_err();
        assert_eq!(err, CoordError::NodeExists("/a".to_string()));
    }

    #[tokio::test]
    async fn test_sequential_names_increase() {
        let (_store, conn) = conn();
        let a = conn
            .create("/locks/x/lock-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        let b = conn
            .create("/locks/x/lock-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(a, "/locks/x/lock-0000000000");
        assert_eq!(b, "/locks/x/lock-0000000001");

        // Sequence numbers are not reused after deletion.
        conn.delete(&b).await.unwrap();
        let c = conn
            .create("/locks/x/lock-", vec![], CreateMode::PersistentSequential)
            .await
            .unwrap();
        assert_eq!(c, "/locks/x/lock-0000000002");
    }

    #[tokio::test]
    async fn test_set_with_version() {
        let (_store, conn) = conn();
        conn.create("/a", b"1".to_vec(), CreateMode::Persistent).await.unwrap();
        let v = conn.set("/a", b"2".to_vec(), Some(0)).await.unwrap();
        assert_eq!(v, 1);

        let err = conn.set("/a", b"3".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(err, CoordError::BadVersion { actual: 1, .. }));

        let err = conn.set("/missing", vec![], None).await.unwrap_err();
        assert!(err.is_no_node());
    }

    #[tokio::test]
    async fn test_delete_requires_empty() {
        let (_store, conn) = conn();
        conn.create("/a/b/c", vec![], CreateMode::Persistent).await.unwrap();
        assert!(matches!(
            conn.delete("/a").await.unwrap_err(),
            CoordError::NotEmpty(_)
        ));

        conn.delete_all("/a").await.unwrap();
        assert!(!conn.exists("/a").await.unwrap());
        assert!(!conn.exists("/a/b/c").await.unwrap());
        assert!(conn.delete("/a").await.unwrap_err().is_no_node());
    }

    #[tokio::test]
    async fn test_delete_all_keeps_siblings() {
        let (_store, conn) = conn();
        conn.create("/a/b", vec![], CreateMode::Persistent).await.unwrap();
        conn.create("/ab", vec![], CreateMode::Persistent).await.unwrap();
        conn.delete_all("/a").await.unwrap();
        assert!(conn.exists("/ab").await.unwrap());
    }

    #[tokio::test]
    async fn test_children_watch_fires_on_create() {
        let (_store, conn) = conn();
        conn.create("/services", vec![], CreateMode::Persistent).await.unwrap();
        let (children, watch) = conn.children_w("/services").await.unwrap();
        assert!(children.is_empty());

        conn.create("/services/web", vec![], CreateMode::Persistent).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::ChildrenChanged);
        assert_eq!(event.path, "/services");
    }

    #[tokio::test]
    async fn test_data_watch_fires_on_set_and_delete() {
        let (_store, conn) = conn();
        conn.create("/a", vec![], CreateMode::Persistent).await.unwrap();

        let (_, watch) = conn.get_w("/a").await.unwrap();
        conn.set("/a", b"x".to_vec(), None).await.unwrap();
        assert_eq!(watch.changed().await.unwrap().kind, EventKind::DataChanged);

        let (_, watch) = conn.get_w("/a").await.unwrap();
        conn.delete("/a").await.unwrap();
        assert_eq!(watch.changed().await.unwrap().kind, EventKind::Deleted);
    }

    #[tokio::test]
    async fn test_expire_removes_ephemeral_nodes() {
        let store = MemoryStore::new();
        let agent = store.session();
        let observer = store.session();

        agent
            .create("/registry/hosts/h1", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        let (children, watch) = observer.children_w("/registry/hosts").await.unwrap();
        assert_eq!(children, vec!["h1"]);

        agent.expire().await;
        watch.changed().await.unwrap();
        assert!(observer.children("/registry/hosts").await.unwrap().is_empty());
        assert_eq!(
            agent.exists("/registry").await.unwrap_err(),
            CoordError::SessionExpired
        );
    }

    #[tokio::test]
    async fn test_ephemeral_cannot_have_children() {
        let (_store, conn) = conn();
        conn.create("/e", vec![], CreateMode::Ephemeral).await.unwrap();
        let err = conn.create("/e/child", vec![], CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, CoordError::NoChildrenForEphemerals(_)));
    }

    #[tokio::test]
    async fn test_abandoned_watches_are_pruned() {
        let (store, conn) = conn();
        conn.create("/a", vec![], CreateMode::Persistent).await.unwrap();
        for _ in 0..100 {
            let (_, watch) = conn.get_w("/a").await.unwrap();
            drop(watch);
        }
        let tree = store.tree.lock().await;
        assert_eq!(tree.data_watches.get("/a").map(Vec::len), Some(1));
    }
}
