//! Application configuration for pricewatch.
//!
//! User config lives at `~/.pricewatch/pricewatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PricewatchError, Result};
use crate::types::{LookupStatus, SourceName};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "pricewatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".pricewatch";

/// Placeholder substituted with the item key in `search_url`.
pub const KEY_PLACEHOLDER: &str = "{key}";

/// Commented starter config written by [`init_config`].
const CONFIG_TEMPLATE: &str = r#"# pricewatch configuration

[defaults]
items_file = "items.json"
database_path = "~/.pricewatch/ledger.db"
export_path = "prices.json"

[pipeline]
# Upper bound for a single item lookup, in seconds.
lookup_timeout_secs = 30
# Attempts to open a lookup session before a source gives up.
acquire_attempts = 2
acquire_backoff_ms = 2000
progress_capacity = 1024
heartbeat_secs = 1

# One [[sources]] block per price source. `{key}` in search_url is replaced
# by the item key (e.g. the EAN).
[[sources]]
name = "example"
enabled_by_default = false
search_url = "https://shop.example.com/search?q={key}"
# session_url = "https://shop.example.com/login"
result_selector = ".product-card"
primary_selector = ".price-regular"
secondary_selector = ".price-offer"
auxiliary_selector = ".promo-badge"
not_found_selector = ".empty-results"
# value_pattern = '\$\s*[\d.,]+'
timeout_status = "not_found"
"#;

// ---------------------------------------------------------------------------
// Config structs (matching pricewatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Configured price sources, in ledger column order.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default item list (JSON array of items).
    #[serde(default = "default_items_file")]
    pub items_file: String,

    /// libSQL database holding the persisted ledger.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Where `pricewatch export` writes by default.
    #[serde(default = "default_export_path")]
    pub export_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            items_file: default_items_file(),
            database_path: default_database_path(),
            export_path: default_export_path(),
        }
    }
}

fn default_items_file() -> String {
    "items.json".into()
}
fn default_database_path() -> String {
    "~/.pricewatch/ledger.db".into()
}
fn default_export_path() -> String {
    "prices.json".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-item lookup timeout.
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,

    /// Session acquisition attempts before a source is declared dead.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Delay between acquisition attempts.
    #[serde(default = "default_acquire_backoff_ms")]
    pub acquire_backoff_ms: u64,

    /// Events buffered per progress subscriber before the oldest are dropped.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,

    /// Observer poll timeout; silence longer than this yields a heartbeat.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_secs: default_lookup_timeout_secs(),
            acquire_attempts: default_acquire_attempts(),
            acquire_backoff_ms: default_acquire_backoff_ms(),
            progress_capacity: default_progress_capacity(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_lookup_timeout_secs() -> u64 {
    30
}
fn default_acquire_attempts() -> u32 {
    2
}
fn default_acquire_backoff_ms() -> u64 {
    2000
}
fn default_progress_capacity() -> usize {
    1024
}
fn default_heartbeat_secs() -> u64 {
    1
}

/// Status recorded when a lookup exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStatus {
    #[default]
    NotFound,
    Error,
}

impl From<TimeoutStatus> for LookupStatus {
    fn from(value: TimeoutStatus) -> Self {
        match value {
            TimeoutStatus::NotFound => LookupStatus::NotFound,
            TimeoutStatus::Error => LookupStatus::Error,
        }
    }
}

/// `[[sources]]` entry: one price source driven by CSS selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name, used as the ledger column group.
    pub name: String,

    /// Whether `run` selects this source when no `--source` flag is given.
    #[serde(default = "default_true")]
    pub enabled_by_default: bool,

    /// Search page template; `{key}` is replaced by the item key.
    pub search_url: String,

    /// Page fetched once per session before searching (login, store picker).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_url: Option<String>,

    /// Container of the first matching product. Defaults to the whole page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<String>,

    /// Selector for the primary value (regular price).
    pub primary_selector: String,

    /// Selector for the secondary value (offer price).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_selector: Option<String>,

    /// Selector for the auxiliary value (promotion mechanics).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_selector: Option<String>,

    /// Selector whose presence means "no such product".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found_selector: Option<String>,

    /// Regex applied to extracted text; the first match is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_pattern: Option<String>,

    /// What a timed-out lookup is recorded as.
    #[serde(default)]
    pub timeout_status: TimeoutStatus,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    /// Normalized source name.
    pub fn source_name(&self) -> SourceName {
        SourceName::new(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Validation and derived views
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check source definitions and pipeline settings for obvious mistakes.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.acquire_attempts == 0 {
            return Err(PricewatchError::config(
                "pipeline.acquire_attempts must be at least 1",
            ));
        }
        if self.pipeline.lookup_timeout_secs == 0 {
            return Err(PricewatchError::config(
                "pipeline.lookup_timeout_secs must be at least 1",
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            let name = source.source_name();
            if name.as_str().is_empty() {
                return Err(PricewatchError::config("source with an empty name"));
            }
            if !seen.insert(name.clone()) {
                return Err(PricewatchError::config(format!(
                    "source '{name}' is defined more than once"
                )));
            }
            if !source.search_url.contains(KEY_PLACEHOLDER) {
                return Err(PricewatchError::config(format!(
                    "source '{name}': search_url must contain {KEY_PLACEHOLDER}"
                )));
            }
            let probe = source.search_url.replace(KEY_PLACEHOLDER, "0");
            Url::parse(&probe).map_err(|e| {
                PricewatchError::config(format!("source '{name}': invalid search_url: {e}"))
            })?;
            if let Some(session_url) = &source.session_url {
                Url::parse(session_url).map_err(|e| {
                    PricewatchError::config(format!(
                        "source '{name}': invalid session_url: {e}"
                    ))
                })?;
            }
            if let Some(pattern) = &source.value_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    PricewatchError::config(format!(
                        "source '{name}': invalid value_pattern: {e}"
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// All configured source names, in configuration order.
    pub fn source_names(&self) -> Vec<SourceName> {
        self.sources.iter().map(SourceConfig::source_name).collect()
    }

    /// Sources selected when the caller does not name any.
    pub fn default_selection(&self) -> Vec<SourceName> {
        self.sources
            .iter()
            .filter(|s| s.enabled_by_default)
            .map(SourceConfig::source_name)
            .collect()
    }

    /// Find a source definition by (case-insensitive) name.
    pub fn source(&self, name: &SourceName) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| &s.source_name() == name)
    }
}

// ---------------------------------------------------------------------------
// Pipeline policy (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline policy, derived from the config file.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    /// Upper bound for one lookup call.
    pub lookup_timeout: Duration,
    /// Session acquisition attempts (at least 1).
    pub acquire_attempts: u32,
    /// Delay between acquisition attempts.
    pub acquire_backoff: Duration,
    /// Per-subscriber progress buffer.
    pub progress_capacity: usize,
    /// Observer heartbeat interval.
    pub heartbeat: Duration,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelinePolicy {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            lookup_timeout: Duration::from_secs(p.lookup_timeout_secs),
            acquire_attempts: p.acquire_attempts.max(1),
            acquire_backoff: Duration::from_millis(p.acquire_backoff_ms),
            progress_capacity: p.progress_capacity.max(1),
            heartbeat: Duration::from_secs(p.heartbeat_secs.max(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.pricewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PricewatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.pricewatch/pricewatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PricewatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        PricewatchError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write the starter config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PricewatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    std::fs::write(&path, CONFIG_TEMPLATE).map_err(|e| PricewatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
