//! SQL migration definitions for the pricewatch ledger database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: ledger_meta, ledger_sources, items, source_results, runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Single-row header of the persisted ledger snapshot
CREATE TABLE IF NOT EXISTS ledger_meta (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    taken_at TEXT NOT NULL
);

-- Configured sources at snapshot time, in column order
CREATE TABLE IF NOT EXISTS ledger_sources (
    position INTEGER NOT NULL,
    name     TEXT PRIMARY KEY
);

-- Items, in ledger order
CREATE TABLE IF NOT EXISTS items (
    key         TEXT PRIMARY KEY,
    position    INTEGER NOT NULL,
    code        TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_items_position ON items(position);

-- One result column-group per (item, source)
CREATE TABLE IF NOT EXISTS source_results (
    item_key        TEXT NOT NULL REFERENCES items(key) ON DELETE CASCADE,
    source          TEXT NOT NULL,
    status          TEXT NOT NULL,
    primary_value   TEXT NOT NULL DEFAULT '',
    secondary_value TEXT NOT NULL DEFAULT '',
    auxiliary_value TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (item_key, source)
);

CREATE INDEX IF NOT EXISTS idx_source_results_source ON source_results(source, status);

-- Run history
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    sources_json TEXT NOT NULL,
    force_rescan INTEGER NOT NULL DEFAULT 0,
    state        TEXT NOT NULL,
    stats_json   TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
