use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::watch::StopSignal;

/// Lifecycle of a lock handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Handle constructed, never acquired.
    Created,
    /// Waiting for the backend to grant the lock.
    Acquiring,
    /// Lock granted and monitored.
    Held,
    /// Released by an explicit unlock.
    Released,
    /// Session expired, lock node overwritten or watch invalidated.
    Lost,
}

/// Distributed mutual exclusion on a single key.
///
/// A handle owns one acquisition lifecycle; it is not meant to be shared by
/// independent callers racing acquire/release.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the lock is acquired.
    ///
    /// The returned [`LockLost`] resolves once the lock is no longer held.
    /// Raising `stop` relinquishes monitoring and resolves it as well.
    async fn lock(&self, stop: Option<StopSignal>) -> Result<LockLost, StoreError>;

    /// Release the lock. Releasing a lock that is not held is an error.
    async fn unlock(&self) -> Result<(), StoreError>;

    /// Current lifecycle state.
    fn state(&self) -> LockState;
}

/// Held by the worker that monitors a lock. Dropping it resolves the
/// matching [`LockLost`].
#[derive(Debug)]
pub struct LockLostNotifier {
    _tx: oneshot::Sender<()>,
}

/// Future that resolves when a held lock is lost or released.
#[derive(Debug)]
pub struct LockLost {
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl LockLost {
    pub fn channel() -> (LockLostNotifier, LockLost) {
        let (tx, rx) = oneshot::channel();
        (LockLostNotifier { _tx: tx }, LockLost { rx, done: false })
    }

    /// Non-blocking check.
    pub fn is_lost(&mut self) -> bool {
        if self.done {
            return true;
        }
        self.done = matches!(
            self.rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed) | Ok(())
        );
        self.done
    }
}

impl Future for LockLost {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => {
                self.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
