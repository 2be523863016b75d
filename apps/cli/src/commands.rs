//! CLI command definitions, routing, and tracing setup.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use pricewatch_core::{Controller, RunConfig, load_items};
use pricewatch_lookup::SourceRegistry;
use pricewatch_shared::{
    AppConfig, PipelinePolicy, RunState, SourceName, expand_home, init_config, load_config,
    load_config_from,
};
use pricewatch_storage::Storage;
use tracing::info;

use crate::observer::{CliObserver, spawn_stdin_control};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// pricewatch: concurrent retail price lookups.
#[derive(Parser)]
#[command(
    name = "pricewatch",
    version,
    about = "Resolve current retail prices for a product list across several sources.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.pricewatch/pricewatch.toml).
    #[arg(long, global = true, env = "PRICEWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Look up prices for every item across the selected sources.
    Run {
        /// Item list (JSON array). Defaults to `defaults.items_file`.
        #[arg(long)]
        items: Option<PathBuf>,

        /// Source to run (repeatable). Defaults to every source enabled by default.
        #[arg(short, long = "source")]
        sources: Vec<String>,

        /// Ignore stored results and look every item up again.
        #[arg(long)]
        force_rescan: bool,

        /// Ledger database. Defaults to `defaults.database_path`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Do not read p/r commands from stdin.
        #[arg(long)]
        no_input: bool,
    },

    /// Write the stored ledger as JSON.
    Export {
        /// Ledger database. Defaults to `defaults.database_path`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Output file, or `-` for stdout. Defaults to `defaults.export_path`.
        #[arg(short, long)]
        out: Option<String>,
    },

    /// List configured sources.
    Sources,

    /// Show recent runs.
    History {
        /// Ledger database. Defaults to `defaults.database_path`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Number of runs to show.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    // Progress goes to the observer; logs stay quiet unless asked for.
    let filter = match cli.verbose {
        0 => "pricewatch=warn",
        1 => "pricewatch=info",
        2 => "pricewatch=debug",
        _ => "pricewatch=trace",
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()).await,
        };
    }

    let config = resolve_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            items,
            sources,
            force_rescan,
            db,
            no_input,
        } => cmd_run(&config, items, &sources, force_rescan, db, no_input).await,
        Command::Export { db, out } => cmd_export(&config, db, out.as_deref()).await,
        Command::Sources => cmd_sources(&config),
        Command::History { db, limit } => cmd_history(&config, db, limit).await,
        Command::Config { .. } => Ok(()),
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

fn database_path(config: &AppConfig, db: Option<PathBuf>) -> PathBuf {
    db.unwrap_or_else(|| expand_home(&config.defaults.database_path))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    items: Option<PathBuf>,
    sources: &[String],
    force_rescan: bool,
    db: Option<PathBuf>,
    no_input: bool,
) -> Result<()> {
    if config.sources.is_empty() {
        return Err(eyre!(
            "no sources configured; run `pricewatch config init` and add [[sources]] blocks"
        ));
    }

    let selected: Vec<SourceName> = if sources.is_empty() {
        config.default_selection()
    } else {
        sources.iter().map(SourceName::new).collect()
    };

    let items_path = items.unwrap_or_else(|| expand_home(&config.defaults.items_file));
    let items = load_items(&items_path)?;
    let db_path = database_path(config, db);

    info!(
        items = items.len(),
        sources = selected.len(),
        force_rescan,
        db = %db_path.display(),
        "starting run"
    );

    let policy = PipelinePolicy::from(config);
    let registry = SourceRegistry::from_config(config)?;
    let store = Arc::new(Storage::open(&db_path).await?);
    let controller = Arc::new(Controller::new(registry, store, policy.clone()));

    let mut subscription = controller.subscribe().await;
    controller
        .start(RunConfig {
            sources: selected,
            force_rescan,
            items: Some(items),
        })
        .await?;

    let interactive = !no_input && std::io::stdin().is_terminal();
    let control = interactive.then(|| spawn_stdin_control(controller.clone()));

    // Found slots are skipped and never produce an update.
    let total = controller.status().await.planned_lookups;
    let observer = CliObserver::new(total, interactive)?;
    observer
        .follow(&mut subscription, policy.heartbeat, || controller.is_paused())
        .await;

    if let Some(handle) = control {
        handle.abort();
    }

    let outcome = controller.wait().await?;
    observer.summary(&outcome);

    if outcome.state == RunState::Failed {
        return Err(eyre!("{}", outcome.message));
    }
    Ok(())
}

async fn cmd_export(config: &AppConfig, db: Option<PathBuf>, out: Option<&str>) -> Result<()> {
    let db_path = database_path(config, db);
    let store = Storage::open_readonly(&db_path).await?;
    let snapshot = store
        .load_snapshot()
        .await?
        .ok_or_else(|| eyre!("no ledger stored in {}", db_path.display()))?;

    let json = serde_json::to_string_pretty(&snapshot)?;
    let target = out.unwrap_or(config.defaults.export_path.as_str());
    if target == "-" {
        println!("{json}");
    } else {
        let path = expand_home(target);
        std::fs::write(&path, json).map_err(|e| eyre!("cannot write {}: {e}", path.display()))?;
        println!(
            "Exported {} items × {} sources to {}",
            snapshot.rows.len(),
            snapshot.sources.len(),
            path.display()
        );
    }
    Ok(())
}

fn cmd_sources(config: &AppConfig) -> Result<()> {
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }
    for source in &config.sources {
        let marker = if source.enabled_by_default { "*" } else { " " };
        println!("{marker} {:<16} {}", source.source_name(), source.search_url);
    }
    println!();
    println!("* = run when no --source is given");
    Ok(())
}

async fn cmd_history(config: &AppConfig, db: Option<PathBuf>, limit: u32) -> Result<()> {
    let db_path = database_path(config, db);
    let store = Storage::open_readonly(&db_path).await?;
    let runs = store.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<10} {}  sources: {}{}",
            run.started_at,
            run.state,
            run.id,
            run.sources.join(","),
            if run.force_rescan { "  (force rescan)" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
