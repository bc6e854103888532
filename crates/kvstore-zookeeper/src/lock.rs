//! Distributed lock over the client's session lock recipe.
//!
//! Once granted, the lock value is written to the lock node and a monitor
//! task keeps a data watch on it. The lock counts as lost when the session
//! expires, when the watch is invalidated, when someone else writes the
//! node or when the watch cannot be re-armed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kvstore_core::{
    stop_channel, stopped, LockLost, LockLostNotifier, LockState, Locker, StopSignal, StoreError,
};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::client::{
    next_event, world_acl, EventReceiver, SessionLock, Stat, WatchEvent, ZkClient, ZkError,
    ANY_VERSION, PERM_ALL,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock handle on one key.
pub struct ZkLock {
    client: Arc<dyn ZkClient>,
    lock: Box<dyn SessionLock>,
    path: String,
    value: Vec<u8>,
    state: Arc<Mutex<LockState>>,
    /// Stops the monitor of the current acquisition.
    release: Mutex<Option<watch::Sender<bool>>>,
}

impl ZkLock {
    /// Build a handle on the node at `path`. Nothing is acquired yet.
    pub fn new(client: Arc<dyn ZkClient>, path: String, value: Vec<u8>) -> Self {
        let lock = client.new_lock(&path, world_acl(PERM_ALL));
        Self {
            client,
            lock,
            path,
            value,
            state: Arc::new(Mutex::new(LockState::Created)),
            release: Mutex::new(None),
        }
    }

    fn set_state(&self, state: LockState) {
        *guard(&self.state) = state;
    }
}

#[async_trait]
impl Locker for ZkLock {
    #[instrument(skip(self, stop), fields(path = %self.path), level = "debug")]
    async fn lock(&self, stop: Option<StopSignal>) -> Result<LockLost, StoreError> {
        self.set_state(LockState::Acquiring);

        if let Err(e) = self.lock.lock().await {
            self.set_state(LockState::Created);
            return Err(e.into());
        }

        let written = match self.client.set(&self.path, &self.value, ANY_VERSION).await {
            Ok(stat) => stat,
            Err(e) => {
                warn!("Failed to write lock value on {}: {}", self.path, e);
                self.set_state(LockState::Created);
                return Err(e.into());
            }
        };

        // Armed before returning so a write racing the caller is observed.
        let armed = self.client.get_w(&self.path).await;
        self.set_state(LockState::Held);

        let (notifier, lost) = LockLost::channel();
        let (release_tx, release_rx) = stop_channel();
        *guard(&self.release) = Some(release_tx);

        let monitor = Monitor {
            client: self.client.clone(),
            path: self.path.clone(),
            state: self.state.clone(),
            version: written.version,
        };
        tokio::spawn(monitor.run(armed, stop, release_rx, notifier));

        info!("Acquired lock on {}", self.path);
        Ok(lost)
    }

    #[instrument(skip(self), fields(path = %self.path), level = "debug")]
    async fn unlock(&self) -> Result<(), StoreError> {
        self.lock.unlock().await?;
        self.set_state(LockState::Released);

        if let Some(release) = guard(&self.release).take() {
            let _ = release.send(true);
        }

        info!("Released lock on {}", self.path);
        Ok(())
    }

    fn state(&self) -> LockState {
        *guard(&self.state)
    }
}

/// Result of arming a data watch on the lock node.
type Armed = Result<(Vec<u8>, Stat, EventReceiver), ZkError>;

/// Watches the lock node of one acquisition.
struct Monitor {
    client: Arc<dyn ZkClient>,
    path: String,
    state: Arc<Mutex<LockState>>,
    /// Data version left by our own write. Any other version seen when
    /// arming means the node was overwritten in between.
    version: i32,
}

impl Monitor {
    /// Run until the lock is lost or monitoring is stopped. Dropping
    /// `_notifier` on return resolves the caller's [`LockLost`].
    async fn run(
        self,
        first: Armed,
        mut stop: Option<StopSignal>,
        release: StopSignal,
        _notifier: LockLostNotifier,
    ) {
        let Monitor {
            client,
            path,
            state,
            version,
        } = self;
        let mut release = Some(release);
        let mut pending = Some(first);

        let reason = loop {
            let armed = match pending.take() {
                Some(armed) => armed,
                None => client.get_w(&path).await,
            };
            let mut events = match armed {
                Ok((_, stat, _)) if stat.version != version => {
                    break "lock node overwritten".to_string()
                }
                Ok((_, _, events)) => events,
                Err(e) => break format!("cannot watch lock node: {}", e),
            };

            tokio::select! {
                biased;
                _ = stopped(&mut release) => {
                    debug!("Stopped monitoring lock on {}", path);
                    return;
                }
                _ = stopped(&mut stop) => break "relinquished by caller".to_string(),
                event = next_event(&mut events) => match event {
                    WatchEvent::SessionExpired => break "session expired".to_string(),
                    WatchEvent::NotWatching => break "watch invalidated".to_string(),
                    WatchEvent::DataChanged => break "lock node overwritten".to_string(),
                    WatchEvent::ChildrenChanged | WatchEvent::Other => {
                        debug!("Re-arming lock watch on {} after {:?}", path, event);
                    }
                },
            }
        };

        let mut current = guard(&state);
        if *current == LockState::Held {
            *current = LockState::Lost;
            warn!("Lost lock on {}: {}", path, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::client::CreateMode;
    use crate::memory::{MemoryBackend, MemoryEnsemble};

    const WAIT: Duration = Duration::from_secs(2);

    fn handle(client: &MemoryBackend, path: &str, value: &[u8]) -> ZkLock {
        ZkLock::new(Arc::new(client.clone()), path.to_string(), value.to_vec())
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");
        assert_eq!(lock.state(), LockState::Created);

        let lost = lock.lock(None).await.unwrap();
        assert_eq!(lock.state(), LockState::Held);
        assert_eq!(client.get("/locks/job").await.unwrap().0, b"owner-1");

        lock.unlock().await.unwrap();
        assert_eq!(lock.state(), LockState::Released);
        timeout(WAIT, lost).await.expect("monitor still running");
        assert_eq!(lock.state(), LockState::Released);
    }

    #[tokio::test]
    async fn test_unlock_without_lock_fails() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"");

        assert!(matches!(lock.unlock().await, Err(StoreError::Lock(_))));
    }

    #[tokio::test]
    async fn test_session_expiry_loses_lock() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");

        let lost = lock.lock(None).await.unwrap();
        client.expire();

        timeout(WAIT, lost).await.expect("loss not signalled");
        assert_eq!(lock.state(), LockState::Lost);
        assert!(matches!(
            lock.unlock().await,
            Err(StoreError::Invalidated(_))
        ));
    }

    #[tokio::test]
    async fn test_overwritten_node_loses_lock() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let intruder = ensemble.connect();
        let lock = handle(&owner, "/locks/job", b"owner-1");

        let mut lost = lock.lock(None).await.unwrap();
        assert!(!lost.is_lost());

        intruder
            .set("/locks/job", b"intruder", ANY_VERSION)
            .await
            .unwrap();
        timeout(WAIT, &mut lost).await.expect("loss not signalled");
        assert!(lost.is_lost());
        assert_eq!(lock.state(), LockState::Lost);
    }

    #[tokio::test]
    async fn test_overwrite_before_first_watch_loses_lock() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let intruder = ensemble.connect();
        owner
            .create("/locks/job", b"", CreateMode::Persistent, &[])
            .await
            .unwrap();

        // Someone writes between our value write and the first watch.
        let written = owner
            .set("/locks/job", b"owner-1", ANY_VERSION)
            .await
            .unwrap();
        intruder
            .set("/locks/job", b"intruder", ANY_VERSION)
            .await
            .unwrap();
        let armed = owner.get_w("/locks/job").await;

        let state = Arc::new(Mutex::new(LockState::Held));
        let (notifier, lost) = LockLost::channel();
        let (_release_tx, release) = stop_channel();
        let monitor = Monitor {
            client: Arc::new(owner.clone()),
            path: "/locks/job".to_string(),
            state: state.clone(),
            version: written.version,
        };
        tokio::spawn(monitor.run(armed, None, release, notifier));

        timeout(WAIT, lost).await.expect("loss not signalled");
        assert_eq!(*guard(&state), LockState::Lost);
    }

    #[tokio::test]
    async fn test_failed_value_write_resets_state() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");
        let other = handle(&ensemble.connect(), "/locks/job", b"owner-2");

        ensemble.fail_next_set("/locks/job", ZkError::ConnectionClosed);
        assert!(matches!(
            lock.lock(None).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(lock.state(), LockState::Created);
        assert!(client.get("/locks/job").await.unwrap().0.is_empty());

        // The backend lock stays granted until the caller releases it.
        let waiter = tokio::spawn(async move { other.lock(None).await.map(|_| other.state()) });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        lock.unlock().await.unwrap();
        let state = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(state, LockState::Held);
    }

    #[tokio::test]
    async fn test_invalidated_watch_loses_lock() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");

        let lost = lock.lock(None).await.unwrap();
        timeout(WAIT, async {
            while ensemble.trigger("/locks/job", WatchEvent::NotWatching) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        timeout(WAIT, lost).await.expect("loss not signalled");
        assert_eq!(lock.state(), LockState::Lost);
    }

    #[tokio::test]
    async fn test_child_events_keep_lock() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");

        let mut lost = lock.lock(None).await.unwrap();
        timeout(WAIT, async {
            while ensemble.trigger("/locks/job", WatchEvent::Other) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!lost.is_lost());
        assert_eq!(lock.state(), LockState::Held);
        lock.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_caller_stop_ends_monitoring() {
        let ensemble = MemoryEnsemble::new();
        let client = ensemble.connect();
        let lock = handle(&client, "/locks/job", b"owner-1");

        let (stop_tx, stop) = stop_channel();
        let lost = lock.lock(Some(stop)).await.unwrap();
        stop_tx.send(true).unwrap();

        timeout(WAIT, lost).await.expect("loss not signalled");
        assert_eq!(lock.state(), LockState::Lost);
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let ensemble = MemoryEnsemble::new();
        let first = handle(&ensemble.connect(), "/locks/job", b"one");
        let second = Arc::new(handle(&ensemble.connect(), "/locks/job", b"two"));

        first.lock(None).await.unwrap();

        let waiter = {
            let second = second.clone();
            tokio::spawn(async move { second.lock(None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(second.state(), LockState::Acquiring);

        first.unlock().await.unwrap();
        timeout(WAIT, waiter)
            .await
            .expect("second holder never acquired")
            .unwrap()
            .unwrap();
        assert_eq!(second.state(), LockState::Held);
    }

    #[tokio::test]
    async fn test_lock_node_is_not_ephemeral() {
        let ensemble = MemoryEnsemble::new();
        let owner = ensemble.connect();
        let observer = ensemble.connect();
        let lock = handle(&owner, "/locks/job", b"owner-1");

        lock.lock(None).await.unwrap();
        owner.expire();

        // The recipe's ephemeral child goes with the session, the lock node stays.
        assert!(observer.exists("/locks/job").await.unwrap().0);
        assert!(observer.children("/locks/job").await.unwrap().is_empty());
    }
}
