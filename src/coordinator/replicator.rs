//! Background replication for `replication.mode = "async"`
//!
//! Sessions append committed writes to the [`ReplicationLog`] through a
//! [`ReplicationHandle`]; a single task ships them to the secondary in
//! sequence order, retrying each entry with capped exponential backoff until
//! the peer confirms it. Delivery is at-least-once: an entry confirmed by the
//! peer but not yet recorded in the cursor is resent after a restart.

use crate::common::{Backoff, Error, Result};
use crate::coordinator::replication_client::ReplicationClient;
use crate::coordinator::replication_log::{LogEntry, ReplicationLog};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type SharedLog = Arc<Mutex<ReplicationLog>>;

fn lock(log: &SharedLog) -> Result<MutexGuard<'_, ReplicationLog>> {
    log.lock()
        .map_err(|_| Error::Internal("replication log lock poisoned".into()))
}

/// Run file I/O on the log (appends, fsyncs, cursor writes) off the async workers
async fn on_log<T, F>(log: &SharedLog, f: F) -> Result<T>
where
    F: FnOnce(&mut ReplicationLog) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let log = log.clone();
    tokio::task::spawn_blocking(move || f(&mut *lock(&log)?))
        .await
        .map_err(|e| Error::Internal(format!("replication log task failed: {}", e)))?
}

/// Cheap, cloneable entry point used by sessions
#[derive(Clone)]
pub struct ReplicationHandle {
    log: SharedLog,
    notify: Arc<Notify>,
}

impl ReplicationHandle {
    /// Durably queue a committed write for the secondary
    pub async fn enqueue(&self, command: &str) -> Result<u64> {
        let command = command.to_string();
        let sequence = on_log(&self.log, move |log| log.append(&command)).await?;
        self.notify.notify_one();
        Ok(sequence)
    }

    /// Writes not yet confirmed by the secondary
    pub fn backlog(&self) -> Result<u64> {
        Ok(lock(&self.log)?.backlog())
    }
}

struct Replicator {
    log: SharedLog,
    notify: Arc<Notify>,
    client: ReplicationClient,
    peer: String,
    backoff: Backoff,
}

/// Spawn the replication task. Entries left over from a previous run are
/// shipped first.
pub fn start_replicator(
    log: ReplicationLog,
    client: ReplicationClient,
    peer: String,
    backoff: Backoff,
) -> (ReplicationHandle, JoinHandle<()>) {
    let backlog = log.backlog();
    if backlog > 0 {
        tracing::info!("Catching up {} unreplicated write(s) to {}", backlog, peer);
    }

    let log = Arc::new(Mutex::new(log));
    let notify = Arc::new(Notify::new());

    let handle = ReplicationHandle {
        log: log.clone(),
        notify: notify.clone(),
    };
    let replicator = Replicator {
        log,
        notify,
        client,
        peer,
        backoff,
    };

    (handle, tokio::spawn(replicator.run()))
}

impl Replicator {
    async fn run(mut self) {
        loop {
            let pending = match lock(&self.log).map(|log| log.pending()) {
                Ok(pending) => pending,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    tracing::error!("Cannot read replication log: {}; retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            if pending.is_empty() {
                match on_log(&self.log, |log| log.compact_if_drained()).await {
                    Ok(true) => tracing::debug!("Replication log drained and truncated"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Replication log compaction failed: {}", e),
                }
                self.notify.notified().await;
                continue;
            }

            for entry in pending {
                self.ship(&entry).await;
            }
        }
    }

    /// Send one entry until the peer confirms it
    async fn ship(&mut self, entry: &LogEntry) {
        loop {
            let outcome = self.client.send(&entry.command, &self.peer).await;
            if outcome.is_success() {
                self.backoff.reset();
                let sequence = entry.sequence;
                if let Err(e) = on_log(&self.log, move |log| log.acknowledge(sequence)).await {
                    // the entry stays pending and will be sent again
                    tracing::error!(
                        "Failed to record replication of entry {}: {}",
                        entry.sequence,
                        e
                    );
                }
                tracing::debug!("Replicated entry {} to {}", entry.sequence, self.peer);
                return;
            }

            let delay = self.backoff.next_delay();
            tracing::warn!(
                "Replication of entry {} to {} failed: {}; retrying in {:?}",
                entry.sequence,
                self.peer,
                outcome,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}
