//! Shared types, error model, and configuration for pricewatch.
//!
//! This crate is the foundation depended on by all other pricewatch crates.
//! It provides:
//! - [`PricewatchError`], the unified error type
//! - Domain types ([`Item`], [`SourceName`], [`SourceResult`], [`LedgerSnapshot`], [`RunId`])
//! - Configuration ([`AppConfig`], [`SourceConfig`], [`PipelinePolicy`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, KEY_PLACEHOLDER, PipelineConfig, PipelinePolicy, SourceConfig,
    TimeoutStatus, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from,
};
pub use error::{PricewatchError, Result};
pub use types::{
    Item, LedgerRow, LedgerSnapshot, LookupStatus, RunId, RunState, SourceName, SourceResult,
};
