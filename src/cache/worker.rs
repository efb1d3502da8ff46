//! Eviction worker.
//!
//! Entry updates report their size change through a bounded queue instead of
//! touching the registry directly, so an entry lock and the registry lock are
//! never held together. A single task consumes the queue in FIFO order and
//! applies the deltas, evicting as needed.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::keys::Key;
use super::lock::mutex_lock;
use super::registry::Registry;

const SOURCE: &str = "cache::worker";

/// Commands understood by the eviction worker.
#[derive(Debug)]
pub(crate) enum EvictionCommand {
    /// An entry's computed size changed by `delta` bytes.
    SizeChanged {
        key: Key,
        store_id: u64,
        delta: isize,
    },
    /// Acknowledged once every command queued before it has been applied.
    Sync(oneshot::Sender<()>),
    /// Stops the worker after the commands queued before it.
    Shutdown,
}

/// Handle to the spawned eviction task.
pub(crate) struct EvictionWorker {
    commands: mpsc::Sender<EvictionCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionWorker {
    /// Spawns the worker on the current Tokio runtime.
    pub(crate) fn spawn(registry: Arc<Registry>, capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run(registry, receiver));

        Self {
            commands,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queues a size change, waiting for room if the queue is full.
    pub(crate) async fn size_changed(&self, key: Key, store_id: u64, delta: isize) {
        let command = EvictionCommand::SizeChanged {
            key,
            store_id,
            delta,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command).await {
            debug!(?command, "Eviction worker stopped, size change dropped");
        }
    }

    /// Waits until all previously queued size changes have been applied.
    pub(crate) async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(EvictionCommand::Sync(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Drains the queue and stops the worker. Later calls are no-ops.
    pub(crate) async fn shutdown(&self) {
        let Some(handle) = mutex_lock(&self.handle, SOURCE, "shutdown").take() else {
            return;
        };

        let _ = self.commands.send(EvictionCommand::Shutdown).await;
        if let Err(err) = handle.await {
            warn!(error = %err, "Eviction worker terminated abnormally");
        }
    }
}

async fn run(registry: Arc<Registry>, mut commands: mpsc::Receiver<EvictionCommand>) {
    debug!(max_bytes = registry.max_bytes(), "Eviction worker started");

    while let Some(command) = commands.recv().await {
        match command {
            EvictionCommand::SizeChanged {
                key,
                store_id,
                delta,
            } => {
                let evicted = registry.apply_size_delta(&key, store_id, delta);
                if evicted > 0 {
                    debug!(
                        %key,
                        delta,
                        evicted,
                        total_bytes = registry.total_bytes(),
                        "Cache over budget, entries evicted"
                    );
                }
            }
            EvictionCommand::Sync(ack) => {
                let _ = ack.send(());
            }
            EvictionCommand::Shutdown => break,
        }
    }

    debug!("Eviction worker stopped");
}
