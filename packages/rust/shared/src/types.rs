//! Core domain types for pricewatch ledgers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PricewatchError;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// SourceName
// ---------------------------------------------------------------------------

/// Name of one external price source (e.g. `"nini"`, `"vea"`).
///
/// Names are normalized to lowercase so that config, CLI flags and the
/// persisted ledger agree regardless of how the user typed them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceName(String);

impl SourceName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// LookupStatus / SourceResult
// ---------------------------------------------------------------------------

/// Resolution state of one item against one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupStatus {
    /// Not yet looked up (or reset by a force rescan).
    #[default]
    Pending,
    /// A price was obtained.
    Found,
    /// The source answered but has no such item.
    NotFound,
    /// The lookup failed (session died, page broke, acquisition failed).
    Error,
}

impl LookupStatus {
    /// Storage key for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Found => "found",
            Self::NotFound => "not_found",
            Self::Error => "error",
        }
    }

    /// Whether a slot in this state is eligible for lookup in a new run.
    ///
    /// Anything short of a confirmed `Found` is retried every run.
    pub fn needs_lookup(&self) -> bool {
        !matches!(self, Self::Found)
    }
}

impl std::fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LookupStatus {
    type Err = PricewatchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "found" => Ok(Self::Found),
            "not_found" => Ok(Self::NotFound),
            "error" => Ok(Self::Error),
            other => Err(PricewatchError::validation(format!(
                "unknown lookup status '{other}'"
            ))),
        }
    }
}

/// Outcome of resolving one item against one source.
///
/// The three values are source-defined (regular price, promotional price,
/// promotion mechanics, ...). Absent values are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceResult {
    pub status: LookupStatus,
    #[serde(default)]
    pub primary_value: String,
    #[serde(default)]
    pub secondary_value: String,
    #[serde(default)]
    pub auxiliary_value: String,
}

impl SourceResult {
    pub fn pending() -> Self {
        Self::default()
    }

    /// A found result. Values are trimmed, and a lone secondary value is
    /// promoted to primary so that `primary_value` is never empty when
    /// anything was found.
    pub fn found(
        primary: impl Into<String>,
        secondary: impl Into<String>,
        auxiliary: impl Into<String>,
    ) -> Self {
        let mut primary = primary.into().trim().to_string();
        let mut secondary = secondary.into().trim().to_string();
        if primary.is_empty() && !secondary.is_empty() {
            primary = std::mem::take(&mut secondary);
        }
        Self {
            status: LookupStatus::Found,
            primary_value: primary,
            secondary_value: secondary,
            auxiliary_value: auxiliary.into().trim().to_string(),
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(LookupStatus::NotFound)
    }

    pub fn error() -> Self {
        Self::with_status(LookupStatus::Error)
    }

    /// A result carrying only a status, with all values empty.
    pub fn with_status(status: LookupStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// One product to be priced.
///
/// `key` is the lookup identifier sent to every source (typically an EAN).
/// `code` and `description` are descriptive metadata, immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    #[serde(alias = "ean", alias = "sku", alias = "SKU")]
    pub key: String,
    #[serde(default, alias = "codigo")]
    pub code: String,
    #[serde(default, alias = "descripcion")]
    pub description: String,
}

impl Item {
    pub fn new(
        key: impl Into<String>,
        code: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into().trim().to_string(),
            code: code.into(),
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger snapshot
// ---------------------------------------------------------------------------

/// One item row of a ledger snapshot, with one result per configured source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub item: Item,
    pub results: BTreeMap<SourceName, SourceResult>,
}

/// Immutable, serializable copy of a whole ledger.
///
/// This is the persisted form: the storage layer writes and reads exactly this
/// structure, and `pricewatch export` serializes it to JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Configured sources, in configuration order.
    pub sources: Vec<SourceName>,
    /// Rows in ledger order.
    pub rows: Vec<LedgerRow>,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// Look up a row by item key.
    pub fn row(&self, key: &str) -> Option<&LedgerRow> {
        self.rows.iter().find(|r| r.item.key == key)
    }

    /// Count slots with the given status for one source.
    pub fn count(&self, source: &SourceName, status: LookupStatus) -> usize {
        self.rows
            .iter()
            .filter(|r| r.results.get(source).map(|res| res.status) == Some(status))
            .count()
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Lifecycle of a run, tracked structurally instead of guessed from timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn source_name_is_normalized() {
        assert_eq!(SourceName::new(" VEA "), SourceName::new("vea"));
        assert_eq!(SourceName::from("Disco").as_str(), "disco");
    }

    #[test]
    fn needs_lookup_only_skips_found() {
        assert!(LookupStatus::Pending.needs_lookup());
        assert!(LookupStatus::NotFound.needs_lookup());
        assert!(LookupStatus::Error.needs_lookup());
        assert!(!LookupStatus::Found.needs_lookup());
    }

    #[test]
    fn status_parses_storage_keys() {
        for status in [
            LookupStatus::Pending,
            LookupStatus::Found,
            LookupStatus::NotFound,
            LookupStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<LookupStatus>().unwrap(), status);
        }
        assert!("maybe".parse::<LookupStatus>().is_err());
    }

    #[test]
    fn lone_secondary_value_is_promoted() {
        let res = SourceResult::found("", " $ 1.299,00 ", "");
        assert_eq!(res.status, LookupStatus::Found);
        assert_eq!(res.primary_value, "$ 1.299,00");
        assert_eq!(res.secondary_value, "");

        let res = SourceResult::found("$ 1.500", "$ 1.299", "2x1");
        assert_eq!(res.primary_value, "$ 1.500");
        assert_eq!(res.secondary_value, "$ 1.299");
        assert_eq!(res.auxiliary_value, "2x1");
    }

    #[test]
    fn status_only_results_have_empty_values() {
        let res = SourceResult::error();
        assert_eq!(res.status, LookupStatus::Error);
        assert!(res.primary_value.is_empty());
        assert!(res.secondary_value.is_empty());
        assert!(res.auxiliary_value.is_empty());
    }

    #[test]
    fn item_accepts_spreadsheet_column_aliases() {
        let json = r#"[{"ean": "7790001", "codigo": "A1", "descripcion": "Yerba 1kg"},
                       {"key": "7790002"}]"#;
        let items: Vec<Item> = serde_json::from_str(json).expect("parse items");
        assert_eq!(items[0].key, "7790001");
        assert_eq!(items[0].code, "A1");
        assert_eq!(items[0].description, "Yerba 1kg");
        assert_eq!(items[1].code, "");
    }

    #[test]
    fn snapshot_serialization() {
        let mut results = BTreeMap::new();
        results.insert(SourceName::new("vea"), SourceResult::found("100", "", ""));
        let snapshot = LedgerSnapshot {
            sources: vec![SourceName::new("vea")],
            rows: vec![LedgerRow {
                item: Item::new("779", "A1", "Yerba"),
                results,
            }],
            taken_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&snapshot).expect("serialize");
        let parsed: LedgerSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, snapshot);
        assert_eq!(parsed.count(&SourceName::new("vea"), LookupStatus::Found), 1);
        assert!(parsed.row("779").is_some());
    }

    #[test]
    fn items_fixture_validates() {
        let fixture = std::fs::read_to_string("../../../fixtures/json/items.fixture.json")
            .expect("read fixture");
        let items: Vec<Item> = serde_json::from_str(&fixture).expect("deserialize fixture items");
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].code, "10021");
    }
}
