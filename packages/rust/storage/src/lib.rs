//! libSQL storage layer for the persisted price ledger.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the latest
//! ledger snapshot (items × sources × results) and the run history.
//!
//! **Access rules:**
//! - The run supervisor is the sole writer, via [`Storage::open`]
//! - Export and history commands read via [`Storage::open_readonly`]
//!
//! A snapshot is always replaced as a whole inside one transaction, so a
//! concurrent reader sees either the previous ledger or the new one, never a
//! mix of both.

mod migrations;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use pricewatch_shared::{
    Item, LedgerRow, LedgerSnapshot, LookupStatus, PricewatchError, Result, RunId, RunState,
    SourceName, SourceResult,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("readonly", &self.readonly)
            .finish_non_exhaustive()
    }
}

/// One recorded run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub sources: Vec<String>,
    pub force_rescan: bool,
    pub state: String,
    pub stats_json: Option<String>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PricewatchError::io(parent, e))?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PricewatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| PricewatchError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PricewatchError::Storage(format!(
                "no ledger database at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| PricewatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| PricewatchError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PricewatchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PricewatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ledger snapshot
    // -----------------------------------------------------------------------

    /// Replace the persisted ledger with `snapshot` in a single transaction.
    pub async fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        self.check_writable()?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;

        tx.execute("DELETE FROM source_results", params![])
            .await
            .map_err(storage_err)?;
        tx.execute("DELETE FROM items", params![])
            .await
            .map_err(storage_err)?;
        tx.execute("DELETE FROM ledger_sources", params![])
            .await
            .map_err(storage_err)?;

        for (position, source) in snapshot.sources.iter().enumerate() {
            tx.execute(
                "INSERT INTO ledger_sources (position, name) VALUES (?1, ?2)",
                params![position as i64, source.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }

        for (position, row) in snapshot.rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO items (key, position, code, description) VALUES (?1, ?2, ?3, ?4)",
                params![
                    row.item.key.as_str(),
                    position as i64,
                    row.item.code.as_str(),
                    row.item.description.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;

            for (source, result) in &row.results {
                tx.execute(
                    "INSERT INTO source_results
                       (item_key, source, status, primary_value, secondary_value, auxiliary_value)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.item.key.as_str(),
                        source.as_str(),
                        result.status.as_str(),
                        result.primary_value.as_str(),
                        result.secondary_value.as_str(),
                        result.auxiliary_value.as_str(),
                    ],
                )
                .await
                .map_err(storage_err)?;
            }
        }

        tx.execute(
            "INSERT INTO ledger_meta (id, taken_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET taken_at = excluded.taken_at",
            params![snapshot.taken_at.to_rfc3339()],
        )
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        tracing::debug!(
            items = snapshot.rows.len(),
            sources = snapshot.sources.len(),
            "ledger snapshot persisted"
        );
        Ok(())
    }

    /// Load the persisted ledger, or `None` if nothing was ever saved.
    pub async fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let mut rows = self
            .conn
            .query("SELECT taken_at FROM ledger_meta WHERE id = 1", params![])
            .await
            .map_err(storage_err)?;

        let taken_at = match rows.next().await.map_err(storage_err)? {
            Some(row) => parse_timestamp(&row.get::<String>(0).map_err(storage_err)?)?,
            None => return Ok(None),
        };

        let mut sources = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT name FROM ledger_sources ORDER BY position",
                params![],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            sources.push(SourceName::new(row.get::<String>(0).map_err(storage_err)?));
        }

        let mut results: HashMap<String, BTreeMap<SourceName, SourceResult>> = HashMap::new();
        let mut rows = self
            .conn
            .query(
                "SELECT item_key, source, status, primary_value, secondary_value, auxiliary_value
                 FROM source_results",
                params![],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let key: String = row.get(0).map_err(storage_err)?;
            let source: String = row.get(1).map_err(storage_err)?;
            let status: String = row.get(2).map_err(storage_err)?;
            let result = SourceResult {
                status: status.parse::<LookupStatus>()?,
                primary_value: row.get::<String>(3).unwrap_or_default(),
                secondary_value: row.get::<String>(4).unwrap_or_default(),
                auxiliary_value: row.get::<String>(5).unwrap_or_default(),
            };
            results
                .entry(key)
                .or_default()
                .insert(SourceName::new(source), result);
        }

        let mut ledger_rows = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT key, code, description FROM items ORDER BY position",
                params![],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let key: String = row.get(0).map_err(storage_err)?;
            let item = Item::new(
                key.clone(),
                row.get::<String>(1).unwrap_or_default(),
                row.get::<String>(2).unwrap_or_default(),
            );
            ledger_rows.push(LedgerRow {
                results: results.remove(&key).unwrap_or_default(),
                item,
            });
        }

        Ok(Some(LedgerSnapshot {
            sources,
            rows: ledger_rows,
            taken_at,
        }))
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(
        &self,
        run_id: &RunId,
        sources: &[SourceName],
        force_rescan: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let names: Vec<&str> = sources.iter().map(SourceName::as_str).collect();
        let sources_json = serde_json::to_string(&names)
            .map_err(|e| PricewatchError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, sources_json, force_rescan, state)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    now.as_str(),
                    sources_json.as_str(),
                    i64::from(force_rescan),
                    RunState::Running.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Mark a run finished with its final state and stats.
    pub async fn finish_run(&self, run_id: &RunId, state: RunState, stats_json: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, state = ?2, stats_json = ?3 WHERE id = ?4",
                params![now.as_str(), state.as_str(), stats_json, run_id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, sources_json, force_rescan, state, stats_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let sources_json: String = row.get(3).map_err(storage_err)?;
            results.push(RunRecord {
                id: row.get::<String>(0).map_err(storage_err)?,
                started_at: row.get::<String>(1).map_err(storage_err)?,
                finished_at: row.get::<String>(2).ok(),
                sources: serde_json::from_str(&sources_json).unwrap_or_default(),
                force_rescan: row.get::<i64>(4).unwrap_or(0) != 0,
                state: row.get::<String>(5).map_err(storage_err)?,
                stats_json: row.get::<String>(6).ok(),
            });
        }
        Ok(results)
    }
}

fn storage_err(e: libsql::Error) -> PricewatchError {
    PricewatchError::Storage(e.to_string())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PricewatchError::Storage(format!("invalid date: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn snapshot(prices: &[(&str, &str)]) -> LedgerSnapshot {
        let vea = SourceName::new("vea");
        let disco = SourceName::new("disco");
        let rows = prices
            .iter()
            .enumerate()
            .map(|(i, (key, price))| {
                let mut results = BTreeMap::new();
                results.insert(vea.clone(), SourceResult::found(*price, "", ""));
                results.insert(disco.clone(), SourceResult::not_found());
                LedgerRow {
                    item: Item::new(*key, format!("C{i}"), format!("item {i}")),
                    results,
                }
            })
            .collect();
        LedgerSnapshot {
            sources: vec![vea, disco],
            rows,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn empty_database_has_no_snapshot() {
        let storage = test_storage().await;
        assert!(storage.load_snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrip_preserves_order_and_values() {
        let storage = test_storage().await;
        let original = snapshot(&[("b-2", "$ 20"), ("a-1", "$ 10"), ("c-3", "$ 30")]);

        storage.save_snapshot(&original).await.expect("save");
        let loaded = storage.load_snapshot().await.unwrap().expect("snapshot");

        assert_eq!(loaded.sources, original.sources);
        assert_eq!(loaded.rows, original.rows);
        let keys: Vec<&str> = loaded.rows.iter().map(|r| r.item.key.as_str()).collect();
        assert_eq!(keys, vec!["b-2", "a-1", "c-3"]);
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let storage = test_storage().await;
        storage
            .save_snapshot(&snapshot(&[("a", "1"), ("b", "2"), ("c", "3")]))
            .await
            .unwrap();
        storage.save_snapshot(&snapshot(&[("z", "9")])).await.unwrap();

        let loaded = storage.load_snapshot().await.unwrap().unwrap();
        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.rows[0].item.key, "z");
        assert_eq!(
            loaded.rows[0].results[&SourceName::new("vea")].primary_value,
            "9"
        );
    }

    #[tokio::test]
    async fn run_history_lifecycle() {
        let storage = test_storage().await;
        let run_id = RunId::new();
        storage
            .insert_run(&run_id, &[SourceName::new("vea"), SourceName::new("nini")], true)
            .await
            .expect("insert run");

        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, "running");
        assert!(runs[0].force_rescan);
        assert_eq!(runs[0].sources, vec!["vea", "nini"]);
        assert!(runs[0].finished_at.is_none());

        storage
            .finish_run(&run_id, RunState::Completed, r#"{"found": 3}"#)
            .await
            .expect("finish run");
        let runs = storage.list_runs(10).await.unwrap();
        assert_eq!(runs[0].state, "completed");
        assert!(runs[0].finished_at.is_some());
        assert!(runs[0].stats_json.as_deref().unwrap().contains("found"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("pw_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.save_snapshot(&snapshot(&[("a", "1")])).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.load_snapshot().await.unwrap().unwrap().rows.len(), 1);
        let result = ro.save_snapshot(&snapshot(&[("b", "2")])).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("pw_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
