//! Snapshot-and-persist of the whole ledger.

use std::sync::Arc;

use tracing::{debug, instrument};

use pricewatch_shared::{LedgerSnapshot, Result};
use pricewatch_storage::Storage;

use crate::ledger::Ledger;

/// Writes ledger snapshots to the store.
///
/// The snapshot is taken under one ledger lock and written in one store
/// transaction, so readers see either the previous table or the new one.
#[derive(Debug, Clone)]
pub struct Consolidator {
    store: Arc<Storage>,
}

impl Consolidator {
    pub fn new(store: Arc<Storage>) -> Self {
        Self { store }
    }

    /// The last persisted ledger, if any.
    pub async fn load_prior(&self) -> Result<Option<LedgerSnapshot>> {
        self.store.load_snapshot().await
    }

    #[instrument(skip_all)]
    pub async fn persist(&self, ledger: &Ledger) -> Result<LedgerSnapshot> {
        let snapshot = ledger.snapshot().await;
        self.store.save_snapshot(&snapshot).await?;
        debug!(rows = snapshot.rows.len(), "ledger persisted");
        Ok(snapshot)
    }
}
