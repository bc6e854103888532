use std::pin::Pin;

use futures::Stream;
use tokio::sync::watch;

use crate::store::KVPair;

/// Stream of snapshots for a single key.
pub type KvStream = Pin<Box<dyn Stream<Item = KVPair> + Send>>;

/// Stream of directory snapshots.
pub type KvListStream = Pin<Box<dyn Stream<Item = Vec<KVPair>> + Send>>;

/// Receiving side of a stop signal. Raised by sending `true`, or by dropping
/// the sender.
pub type StopSignal = watch::Receiver<bool>;

/// Create a stop signal and the sender that raises it.
pub fn stop_channel() -> (watch::Sender<bool>, StopSignal) {
    watch::channel(false)
}

/// Resolves once `stop` is raised. Never resolves for `None`.
pub async fn stopped(stop: &mut Option<StopSignal>) {
    match stop {
        Some(rx) => {
            let _ = rx.wait_for(|&v| v).await;
        }
        None => std::future::pending::<()>().await,
    }
}
