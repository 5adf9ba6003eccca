mod error;
mod mutations;
mod policy;
mod queries;

pub use error::{EngineError, ErrorClass};
pub use policy::{admit, bound_holds, headroom, Admission};

use std::io;
use std::path::PathBuf;

use crate::store::{QuotaStore, WalStore};

/// The quota allocation engine.
///
/// Holds no allocation state of its own: every read goes to the store and
/// every mutation is a single conditional write against it, so several
/// engines over the same store stay consistent.
pub struct Engine<S = WalStore> {
    store: S,
}

impl<S: QuotaStore> Engine<S> {
    pub fn with_store(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl Engine<WalStore> {
    /// Open (or create) a durable engine over the log at `wal_path`.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Ok(Self::with_store(WalStore::open(wal_path)?))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.store.compact().await?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }
}
