//! In-process ensemble with ZooKeeper node semantics.
//!
//! Every [`MemoryBackend`] obtained from [`MemoryEnsemble::connect`] is an
//! independent session over a shared tree: versioned nodes, ephemeral nodes
//! owned by the session, one-shot data and children watches, atomic `multi`
//! batches and a session-scoped lock recipe (ephemeral `lock-N` children
//! under the lock node).
//!
//! The ensemble also exposes fault injection hooks (stale or failing reads,
//! failing writes, raw event triggering, session expiry, request counters)
//! so the adapter can be exercised deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kvstore_core::TlsConfig;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::client::{
    Acl, Connector, CreateMode, DeleteRequest, EventReceiver, SessionLock, Stat, WatchEvent,
    ZkClient, ZkError, ANY_VERSION,
};

/// Marker value returned by reads that are behind the leader.
const STALE_MARKER: &[u8] = &[0x01];

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    stat: Stat,
}

#[derive(Debug)]
struct Watcher {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Expired,
    Closed,
}

#[derive(Debug)]
struct LockHolder {
    session: u64,
    token: u64,
    node: String,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<Watcher>>,
    child_watches: HashMap<String, Vec<Watcher>>,
    sessions: HashMap<u64, SessionStatus>,
    locks: HashMap<String, LockHolder>,
    stale_reads: HashMap<String, usize>,
    failed_reads: HashMap<String, usize>,
    failed_sets: HashMap<String, ZkError>,
    reject_ephemeral_children: bool,
    sequence: u64,
    requests: usize,
    sync_calls: usize,
}

#[derive(Debug)]
struct Ensemble {
    tree: Mutex<Tree>,
    lock_released: Notify,
    next_id: AtomicU64,
}

impl Ensemble {
    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared tree that sessions connect to.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Ensemble>,
}

/// One client session on a [`MemoryEnsemble`].
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    ensemble: Arc<Ensemble>,
    session: u64,
}

fn validate_path(path: &str) -> Result<(), ZkError> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(ZkError::Other(format!("invalid path {:?}", path)))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    &path[path.rfind('/').map_or(0, |i| i + 1)..]
}

fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

fn fire(watches: &mut HashMap<String, Vec<Watcher>>, path: &str, event: WatchEvent) -> usize {
    let watchers = watches.remove(path).unwrap_or_default();
    let count = watchers.len();
    for watcher in watchers {
        let _ = watcher.tx.send(event);
    }
    count
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                data: Vec::new(),
                stat: Stat::default(),
            },
        );
        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            locks: HashMap::new(),
            stale_reads: HashMap::new(),
            failed_reads: HashMap::new(),
            failed_sets: HashMap::new(),
            reject_ephemeral_children: false,
            sequence: 0,
            requests: 0,
            sync_calls: 0,
        }
    }

    /// Count a request from `session` and check that the session is usable.
    fn begin(&mut self, session: u64, path: &str) -> Result<(), ZkError> {
        self.requests += 1;
        self.check_session(session)?;
        validate_path(path)
    }

    fn check_session(&self, session: u64) -> Result<(), ZkError> {
        match self.sessions.get(&session) {
            Some(SessionStatus::Active) => Ok(()),
            Some(SessionStatus::Expired) => Err(ZkError::SessionExpired),
            Some(SessionStatus::Closed) | None => Err(ZkError::ConnectionClosed),
        }
    }

    fn node(&self, path: &str) -> Result<&Node, ZkError> {
        self.nodes.get(path).ok_or(ZkError::NoNode)
    }

    fn read(&mut self, path: &str) -> Result<(Vec<u8>, Stat), ZkError> {
        if let Some(remaining) = self.failed_reads.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ZkError::NoNode);
            }
        }
        let node = self.node(path)?.clone();
        if let Some(remaining) = self.stale_reads.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok((STALE_MARKER.to_vec(), node.stat));
            }
        }
        Ok((node.data, node.stat))
    }

    fn child_names(nodes: &BTreeMap<String, Node>, path: &str) -> Vec<String> {
        nodes
            .keys()
            .filter(|k| parent_of(k) == Some(path))
            .map(|k| name_of(k).to_string())
            .collect()
    }

    fn list_children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        let node = self.node(path)?;
        if node.stat.ephemeral_owner != 0 && self.reject_ephemeral_children {
            return Err(ZkError::NoChildrenForEphemerals);
        }
        Ok(Self::child_names(&self.nodes, path))
    }

    fn watch(&mut self, children: bool, path: &str, session: u64) -> EventReceiver {
        let (tx, rx) = oneshot::channel();
        let watches = if children {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session, tx });
        rx
    }

    fn set(&mut self, path: &str, data: &[u8], version: i32) -> Result<Stat, ZkError> {
        if let Some(err) = self.failed_sets.remove(path) {
            return Err(err);
        }
        let node = self.nodes.get_mut(path).ok_or(ZkError::NoNode)?;
        if version != ANY_VERSION && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        node.data = data.to_vec();
        node.stat.version += 1;
        let stat = node.stat;
        fire(&mut self.data_watches, path, WatchEvent::DataChanged);
        Ok(stat)
    }

    fn create(
        &mut self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        session: u64,
    ) -> Result<(), ZkError> {
        if self.nodes.contains_key(path) {
            return Err(ZkError::NodeExists);
        }
        let parent = parent_of(path).ok_or(ZkError::NodeExists)?.to_string();
        let parent_node = self.nodes.get_mut(&parent).ok_or(ZkError::NoNode)?;
        if parent_node.stat.ephemeral_owner != 0 {
            return Err(ZkError::NoChildrenForEphemerals);
        }
        parent_node.stat.cversion += 1;
        parent_node.stat.num_children += 1;

        let ephemeral_owner = match mode {
            CreateMode::Ephemeral => session,
            CreateMode::Persistent => 0,
        };
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                stat: Stat {
                    ephemeral_owner,
                    ..Stat::default()
                },
            },
        );
        fire(&mut self.child_watches, &parent, WatchEvent::ChildrenChanged);
        Ok(())
    }

    /// Create `path` and its missing ancestors as persistent empty nodes.
    fn create_all(&mut self, path: &str, session: u64) -> Result<(), ZkError> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.create(&current, &[], CreateMode::Persistent, session) {
                Ok(()) | Err(ZkError::NodeExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn check_delete(nodes: &BTreeMap<String, Node>, path: &str, version: i32) -> Result<(), ZkError> {
        if path == "/" {
            return Err(ZkError::Other("cannot delete the root node".to_string()));
        }
        let node = nodes.get(path).ok_or(ZkError::NoNode)?;
        if version != ANY_VERSION && version != node.stat.version {
            return Err(ZkError::BadVersion);
        }
        if nodes.keys().any(|k| parent_of(k) == Some(path)) {
            return Err(ZkError::NotEmpty);
        }
        Ok(())
    }

    fn delete(&mut self, path: &str, version: i32) -> Result<(), ZkError> {
        Self::check_delete(&self.nodes, path, version)?;
        self.nodes.remove(path);
        if let Some(parent) = parent_of(path) {
            if let Some(parent_node) = self.nodes.get_mut(parent) {
                parent_node.stat.cversion += 1;
                parent_node.stat.num_children -= 1;
            }
            fire(&mut self.child_watches, parent, WatchEvent::ChildrenChanged);
        }
        fire(&mut self.data_watches, path, WatchEvent::Other);
        fire(&mut self.child_watches, path, WatchEvent::Other);
        Ok(())
    }

    fn multi(&mut self, ops: &[DeleteRequest]) -> Result<(), ZkError> {
        let mut scratch = self.nodes.clone();
        for op in ops {
            validate_path(&op.path)?;
            Self::check_delete(&scratch, &op.path, op.version)?;
            scratch.remove(&op.path);
        }
        for op in ops {
            self.delete(&op.path, op.version)?;
        }
        Ok(())
    }

    /// Terminate a session: drop its ephemeral nodes, notify its watchers and
    /// release its locks.
    fn end_session(&mut self, session: u64, status: SessionStatus, event: WatchEvent) {
        if self.sessions.get(&session) != Some(&SessionStatus::Active) {
            return;
        }
        self.sessions.insert(session, status);

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for watchers in watches.values_mut() {
                let (ended, kept): (Vec<_>, Vec<_>) =
                    watchers.drain(..).partition(|w| w.session == session);
                *watchers = kept;
                for watcher in ended {
                    let _ = watcher.tx.send(event);
                }
            }
            watches.retain(|_, watchers| !watchers.is_empty());
        }

        self.locks.retain(|_, holder| holder.session != session);

        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort_by(|a, b| b.len().cmp(&a.len()));
        for path in owned {
            let _ = self.delete(&path, ANY_VERSION);
        }
    }
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Ensemble {
                tree: Mutex::new(Tree::new()),
                lock_released: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session.
    pub fn connect(&self) -> MemoryBackend {
        let session = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .tree()
            .sessions
            .insert(session, SessionStatus::Active);
        debug!("Opened in-memory session {}", session);
        MemoryBackend {
            ensemble: self.inner.clone(),
            session,
        }
    }

    /// Make the next `count` reads of `path` return the stale marker byte.
    pub fn stale_reads(&self, path: &str, count: usize) {
        self.inner
            .tree()
            .stale_reads
            .insert(path.to_string(), count);
    }

    /// Make the next `count` reads of `path` fail as if the node was gone.
    pub fn fail_reads(&self, path: &str, count: usize) {
        self.inner
            .tree()
            .failed_reads
            .insert(path.to_string(), count);
    }

    /// Make the next write to `path` fail with `err`.
    pub fn fail_next_set(&self, path: &str, err: ZkError) {
        self.inner
            .tree()
            .failed_sets
            .insert(path.to_string(), err);
    }

    /// Refuse to list children of ephemeral nodes.
    pub fn reject_ephemeral_children(&self, reject: bool) {
        self.inner.tree().reject_ephemeral_children = reject;
    }

    /// Deliver `event` to every data and children watch registered on
    /// `path`. Returns how many registrations fired.
    pub fn trigger(&self, path: &str, event: WatchEvent) -> usize {
        let mut tree = self.inner.tree();
        fire(&mut tree.data_watches, path, event) + fire(&mut tree.child_watches, path, event)
    }

    /// Number of watch registrations pending on `path`.
    pub fn pending_watches(&self, path: &str) -> usize {
        let tree = self.inner.tree();
        tree.data_watches.get(path).map_or(0, Vec::len)
            + tree.child_watches.get(path).map_or(0, Vec::len)
    }

    /// Requests served so far, across all sessions.
    pub fn requests(&self) -> usize {
        self.inner.tree().requests
    }

    /// `sync` calls served so far, across all sessions.
    pub fn sync_calls(&self) -> usize {
        self.inner.tree().sync_calls
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(
        &self,
        endpoints: &[String],
        session_timeout: Duration,
        _tls: Option<&TlsConfig>,
    ) -> Result<Arc<dyn ZkClient>, ZkError> {
        debug!(
            "Connecting in-memory session (endpoints {:?}, timeout {:?})",
            endpoints, session_timeout
        );
        Ok(Arc::new(MemoryEnsemble::connect(self)))
    }
}

impl MemoryBackend {
    /// Expire this session as the server would after a missed heartbeat.
    pub fn expire(&self) {
        self.ensemble
            .tree()
            .end_session(self.session, SessionStatus::Expired, WatchEvent::SessionExpired);
        self.ensemble.lock_released.notify_waiters();
        debug!("Expired in-memory session {}", self.session);
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.ensemble.tree()
    }
}

#[async_trait]
impl ZkClient for MemoryBackend {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Stat), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.read(path)
    }

    async fn get_w(&self, path: &str) -> Result<(Vec<u8>, Stat, EventReceiver), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        let (data, stat) = tree.read(path)?;
        let events = tree.watch(false, path, self.session);
        Ok((data, stat, events))
    }

    async fn set(&self, path: &str, data: &[u8], version: i32) -> Result<Stat, ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.set(path, data, version)
    }

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
        _acl: &[Acl],
    ) -> Result<String, ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.create(path, data, mode, self.session)?;
        Ok(path.to_string())
    }

    async fn delete(&self, path: &str, version: i32) -> Result<(), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.delete(path, version)
    }

    async fn exists(&self, path: &str) -> Result<(bool, Stat), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        Ok(match tree.nodes.get(path) {
            Some(node) => (true, node.stat),
            None => (false, Stat::default()),
        })
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.list_children(path)
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, EventReceiver), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        let children = tree.list_children(path)?;
        let events = tree.watch(true, path, self.session);
        Ok((children, events))
    }

    async fn multi(&self, ops: &[DeleteRequest]) -> Result<(), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, "/")?;
        tree.multi(ops)
    }

    async fn sync(&self, path: &str) -> Result<(), ZkError> {
        let mut tree = self.tree();
        tree.begin(self.session, path)?;
        tree.sync_calls += 1;
        Ok(())
    }

    fn new_lock(&self, path: &str, _acl: Vec<Acl>) -> Box<dyn SessionLock> {
        Box::new(MemoryLock {
            ensemble: self.ensemble.clone(),
            session: self.session,
            token: self.ensemble.next_id.fetch_add(1, Ordering::Relaxed),
            path: path.to_string(),
        })
    }

    async fn close(&self) {
        self.tree()
            .end_session(self.session, SessionStatus::Closed, WatchEvent::NotWatching);
        self.ensemble.lock_released.notify_waiters();
        debug!("Closed in-memory session {}", self.session);
    }
}

/// Lock recipe: the holder owns an ephemeral `lock-N` child of the lock node.
struct MemoryLock {
    ensemble: Arc<Ensemble>,
    session: u64,
    token: u64,
    path: String,
}

impl MemoryLock {
    fn try_acquire(&self) -> Result<bool, ZkError> {
        let mut tree = self.ensemble.tree();
        tree.begin(self.session, &self.path)?;
        if let Some(holder) = tree.locks.get(&self.path) {
            if holder.token == self.token {
                return Err(ZkError::Deadlock);
            }
            return Ok(false);
        }

        tree.create_all(&self.path, self.session)?;
        tree.sequence += 1;
        let node = child_path(&self.path, &format!("lock-{:010}", tree.sequence));
        tree.create(&node, &[], CreateMode::Ephemeral, self.session)?;
        tree.locks.insert(
            self.path.clone(),
            LockHolder {
                session: self.session,
                token: self.token,
                node,
            },
        );
        Ok(true)
    }
}

#[async_trait]
impl SessionLock for MemoryLock {
    async fn lock(&self) -> Result<(), ZkError> {
        loop {
            let released = self.ensemble.lock_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire()? {
                return Ok(());
            }
            released.await;
        }
    }

    async fn unlock(&self) -> Result<(), ZkError> {
        {
            let mut tree = self.ensemble.tree();
            tree.begin(self.session, &self.path)?;
            let node = match tree.locks.get(&self.path) {
                Some(holder) if holder.token == self.token => holder.node.clone(),
                _ => return Err(ZkError::NotLocked),
            };
            tree.locks.remove(&self.path);
            match tree.delete(&node, ANY_VERSION) {
                Ok(()) | Err(ZkError::NoNode) => {}
                Err(e) => return Err(e),
            }
        }
        self.ensemble.lock_released.notify_waiters();
        Ok(())
    }
}
