//! Background workers behind `watch` and `watch_tree`.
//!
//! Each worker owns one chain of one-shot registrations: it emits, waits for
//! the registration to fire, re-arms with a fresh read and loops. The output
//! channel holds a single snapshot so a slow consumer applies backpressure to
//! the worker instead of queueing stale values.

use std::sync::Arc;

use kvstore_core::{stopped, KvListStream, KvStream, StopSignal};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::client::{next_event, EventReceiver, WatchEvent, ZkClient};
use crate::read::{get_list_with_path, get_with_sync_retry, NodeRead};

/// Stream the value of `path`, starting with `initial`.
///
/// A new snapshot follows each data change. Other events on the node (for
/// instance its deletion) only re-arm the watch; the stream ends when the
/// re-arming read fails, when `stop` is raised or when it is dropped.
pub(crate) fn watch_key(
    client: Arc<dyn ZkClient>,
    key: String,
    path: String,
    initial: NodeRead,
    mut stop: Option<StopSignal>,
) -> KvStream {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let mut read = initial;
        let mut fire = true;

        loop {
            let Some(mut events) = read.events.take() else {
                break;
            };

            if fire {
                let pair = read.into_pair(&key);
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    sent = tx.send(pair) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tx.closed() => break,
                event = next_event(&mut events) => {
                    debug!("Watch event on {}: {:?}", path, event);
                    fire = event == WatchEvent::DataChanged;
                }
            }

            read = match get_with_sync_retry(client.as_ref(), &path, true).await {
                Ok(read) => read,
                Err(e) => {
                    debug!("Cannot re-arm watch on {}: {}", path, e);
                    break;
                }
            };
        }

        debug!("Stopped watching {}", path);
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Stream snapshots of the children of `directory`, starting with the
/// children listed by `initial`.
///
/// A snapshot follows each change to the set of children. When a child
/// vanishes between listing and reading, the snapshot is skipped and the
/// watch re-armed immediately; that retry has no bound.
pub(crate) fn watch_directory(
    client: Arc<dyn ZkClient>,
    directory: String,
    initial: (Vec<String>, EventReceiver),
    mut stop: Option<StopSignal>,
) -> KvListStream {
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let (mut children, mut events) = initial;
        let mut fire = true;

        loop {
            let mut rearm_now = false;

            if fire {
                match get_list_with_path(client.as_ref(), &directory, &children).await {
                    Ok(pairs) => {
                        tokio::select! {
                            biased;
                            _ = stopped(&mut stop) => break,
                            sent = tx.send(pairs) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Children of {} changed while reading ({}), re-arming", directory, e);
                        rearm_now = true;
                    }
                }
            }

            if !rearm_now {
                tokio::select! {
                    biased;
                    _ = stopped(&mut stop) => break,
                    _ = tx.closed() => break,
                    event = next_event(&mut events) => {
                        debug!("Watch event on {}: {:?}", directory, event);
                        fire = event == WatchEvent::ChildrenChanged;
                    }
                }
            }

            (children, events) = match client.children_w(&directory).await {
                Ok(listing) => listing,
                Err(e) => {
                    debug!("Cannot re-arm watch on {}: {}", directory, e);
                    break;
                }
            };
        }

        debug!("Stopped watching {}", directory);
    });

    Box::pin(ReceiverStream::new(rx))
}
