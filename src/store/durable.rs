use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use super::{ConditionalWrite, InMemoryStore, QuotaStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    FailNextSync,
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} records failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // The batch is reported failed and never applied in memory, so none
        // of its bytes may survive into the file.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, refusing further appends: {e}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::FailNextSync => wal.fail_next_sync(),
        WalCommand::Append { .. } => unreachable!(),
    }
}

struct Inner {
    mem: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold this shared; compaction holds it exclusively so nothing can
    /// land in the old log between the snapshot and the swap.
    gate: RwLock<()>,
}

/// Durable store: the in-memory tables plus a write-ahead log that receives
/// every committed event before it becomes visible.
pub struct WalStore {
    inner: Arc<Inner>,
}

impl WalStore {
    /// Replay the log at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let replayed = events.len();
        let mem = InMemoryStore::from_events(events);
        tracing::debug!(
            "{}: replayed {replayed} events into {} quotas",
            wal_path.display(),
            mem.quota_count()
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            inner: Arc::new(Inner {
                mem,
                wal_tx,
                gate: RwLock::new(()),
            }),
        })
    }

    /// Rewrite the log as the minimal event set recreating the current state:
    /// every quota's attributes at its current version, then its full ledger.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.inner.gate.write().await;
        let mem = &self.inner.mem;

        let mut ids = mem.quota_ids();
        ids.sort();
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(quota) = mem.get_quota(&id) else { continue };
            let guard = quota.read().await;
            events.push(Event::QuotaCreated {
                id,
                params: guard.params.clone(),
                version: guard.version,
            });
            for allocation in mem.ledger_of(&id) {
                events.push(Event::QuotaAllocated {
                    allocation,
                    version: guard.version,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Make the writer's next fsync fail after its bytes reached the file.
    #[cfg(test)]
    pub(crate) async fn fail_next_sync(&self) {
        let _ = self.inner.wal_tx.send(WalCommand::FailNextSync).await;
    }
}

impl Inner {
    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    async fn insert(&self, id: Ulid, params: QuotaParams) -> Result<Quota, StoreError> {
        let _gate = self.gate.read().await;
        let _slot = self.mem.reserve_slot(id).await?;
        let version = VersionToken::fresh();
        let event = Event::QuotaCreated {
            id,
            params: params.clone(),
            version,
        };
        self.wal_append(&event).await?;
        let quota = Quota::new(id, params, version);
        self.mem.install(quota.clone());
        Ok(quota)
    }

    async fn commit(&self, write: ConditionalWrite) -> Result<Quota, StoreError> {
        let _gate = self.gate.read().await;
        let mut guard = self.mem.lock_expected(write.quota_id, write.expected).await?;
        let event = write.into_event(VersionToken::fresh());
        self.wal_append(&event).await?;
        self.mem.apply(&mut guard, event);
        Ok((*guard).clone())
    }
}

/// Map a panicked or aborted detached write onto the store's error type.
fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::WalError(format!("commit task failed: {e}"))
}

#[async_trait]
impl QuotaStore for WalStore {
    async fn load(&self, id: Ulid) -> Option<Quota> {
        self.inner.mem.load(id).await
    }

    async fn load_with_ledger(&self, id: Ulid) -> Option<(Quota, Vec<Allocation>)> {
        self.inner.mem.load_with_ledger(id).await
    }

    async fn get_allocation(&self, id: Ulid) -> Option<Allocation> {
        self.inner.mem.get_allocation(id).await
    }

    fn quota_ids(&self) -> Vec<Ulid> {
        self.inner.mem.quota_ids()
    }

    fn quota_count(&self) -> usize {
        self.inner.mem.quota_count()
    }

    // Writes run detached: once the record is handed to the WAL, a dropped
    // caller must not stop it from being applied in memory.

    async fn insert(&self, id: Ulid, params: QuotaParams) -> Result<Quota, StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.insert(id, params).await })
            .await
            .map_err(join_error)?
    }

    async fn commit(&self, write: ConditionalWrite) -> Result<Quota, StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.commit(write).await })
            .await
            .map_err(join_error)?
    }
}
