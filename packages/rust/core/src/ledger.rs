//! The item ledger: one result slot per (item, configured source).
//!
//! The ledger is the only state shared between source pipelines. Each
//! pipeline writes its own source's slots; structural reads (`snapshot`,
//! `stats`) take the lock once for the whole copy, so they always observe a
//! consistent table.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use pricewatch_shared::{
    Item, LedgerRow, LedgerSnapshot, LookupStatus, PricewatchError, Result, SourceName,
    SourceResult,
};

/// Per-status slot counts for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub pending: usize,
    pub found: usize,
    pub not_found: usize,
    pub error: usize,
}

impl SourceStats {
    pub fn total(&self) -> usize {
        self.pending + self.found + self.not_found + self.error
    }

    fn add(&mut self, status: LookupStatus) {
        match status {
            LookupStatus::Pending => self.pending += 1,
            LookupStatus::Found => self.found += 1,
            LookupStatus::NotFound => self.not_found += 1,
            LookupStatus::Error => self.error += 1,
        }
    }
}

#[derive(Debug)]
struct Table {
    sources: Vec<SourceName>,
    rows: Vec<LedgerRow>,
    index: HashMap<String, usize>,
}

/// In-memory record set keyed by item key.
#[derive(Debug)]
pub struct Ledger {
    table: RwLock<Table>,
}

impl Ledger {
    /// Build the ledger for a run.
    ///
    /// Items present in `prior` keep every prior result for sources that are
    /// still configured; everything else starts `Pending`. Item metadata
    /// always comes from `items`. With `force_rescan` the prior ledger is
    /// ignored.
    pub fn seed(
        sources: &[SourceName],
        items: Vec<Item>,
        prior: Option<&LedgerSnapshot>,
        force_rescan: bool,
    ) -> Result<Self> {
        let mut seen_sources = HashSet::new();
        for source in sources {
            if !seen_sources.insert(source) {
                return Err(PricewatchError::setup(format!(
                    "source '{source}' configured twice"
                )));
            }
        }

        let prior = if force_rescan { None } else { prior };
        let mut rows = Vec::with_capacity(items.len());
        let mut index = HashMap::with_capacity(items.len());

        for item in items {
            if item.key.is_empty() {
                return Err(PricewatchError::setup(format!(
                    "item at position {} has an empty key",
                    rows.len() + 1
                )));
            }
            if index.contains_key(&item.key) {
                return Err(PricewatchError::setup(format!(
                    "duplicate item key '{}'",
                    item.key
                )));
            }

            let carried = prior.and_then(|p| p.row(&item.key));
            let results: BTreeMap<SourceName, SourceResult> = sources
                .iter()
                .map(|source| {
                    let result = carried
                        .and_then(|row| row.results.get(source))
                        .cloned()
                        .unwrap_or_default();
                    (source.clone(), result)
                })
                .collect();

            index.insert(item.key.clone(), rows.len());
            rows.push(LedgerRow { item, results });
        }

        Ok(Self {
            table: RwLock::new(Table {
                sources: sources.to_vec(),
                rows,
                index,
            }),
        })
    }

    pub async fn get(&self, key: &str, source: &SourceName) -> Option<SourceResult> {
        let table = self.table.read().await;
        let &row = table.index.get(key)?;
        table.rows[row].results.get(source).cloned()
    }

    /// Overwrite one slot. Unknown keys and unconfigured sources are rejected.
    pub async fn set(&self, key: &str, source: &SourceName, result: SourceResult) -> Result<()> {
        let mut table = self.table.write().await;
        let &row = table.index.get(key).ok_or_else(|| {
            PricewatchError::validation(format!("unknown item key '{key}'"))
        })?;
        let slot = table.rows[row].results.get_mut(source).ok_or_else(|| {
            PricewatchError::validation(format!("source '{source}' is not configured"))
        })?;
        *slot = result;
        Ok(())
    }

    /// Whether the slot still has to be resolved. Only `Found` is settled;
    /// unknown keys or sources report `false`.
    pub async fn needs_lookup(&self, key: &str, source: &SourceName) -> bool {
        self.get(key, source)
            .await
            .is_some_and(|r| r.status.needs_lookup())
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let table = self.table.read().await;
        LedgerSnapshot {
            sources: table.sources.clone(),
            rows: table.rows.clone(),
            taken_at: Utc::now(),
        }
    }

    /// Item keys in ledger order.
    pub async fn keys(&self) -> Vec<String> {
        let table = self.table.read().await;
        table.rows.iter().map(|r| r.item.key.clone()).collect()
    }

    /// Items in ledger order.
    pub async fn items(&self) -> Vec<Item> {
        let table = self.table.read().await;
        table.rows.iter().map(|r| r.item.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn sources(&self) -> Vec<SourceName> {
        self.table.read().await.sources.clone()
    }

    pub async fn stats(&self, source: &SourceName) -> SourceStats {
        let table = self.table.read().await;
        let mut stats = SourceStats::default();
        for row in &table.rows {
            if let Some(result) = row.results.get(source) {
                stats.add(result.status);
            }
        }
        stats
    }

    /// `(index, key)` of every item whose slot for `source` has `status`.
    pub async fn keys_with_status(
        &self,
        source: &SourceName,
        status: LookupStatus,
    ) -> Vec<(usize, String)> {
        let table = self.table.read().await;
        table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.results.get(source).map(|r| r.status) == Some(status))
            .map(|(i, row)| (i, row.item.key.clone()))
            .collect()
    }
}
