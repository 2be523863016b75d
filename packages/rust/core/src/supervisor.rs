//! Pipeline supervisor: sets up a run, fans out one pipeline per source,
//! joins them, and consolidates.
//!
//! A run has two halves. [`Supervisor::prepare`] does everything that may
//! legitimately fail (source selection, item validation, reading the prior
//! ledger, persisting the seeded one) and reports failures to the caller.
//! [`Supervisor::execute`] cannot fail: pipeline problems become ledger
//! statuses, and a failed final persist becomes a `Failed` outcome.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, instrument, warn};

use pricewatch_lookup::{SessionFactory, SourceRegistry};
use pricewatch_shared::{
    Item, LedgerSnapshot, LookupStatus, PipelinePolicy, PricewatchError, Result, RunId, RunState,
    SourceName, SourceResult,
};
use pricewatch_storage::Storage;

use crate::consolidator::Consolidator;
use crate::gate::PauseGate;
use crate::ledger::{Ledger, SourceStats};
use crate::pipeline::{self, PipelineReport};
use crate::progress::{LogLevel, ProgressChannel};

/// Immutable inputs of one run.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Sources to run. Must be non-empty and configured.
    pub sources: Vec<SourceName>,
    /// Ignore the persisted ledger and look everything up again.
    pub force_rescan: bool,
    /// Caller-supplied items; when `None` the controller reads the items file.
    pub items: Option<Vec<Item>>,
}

/// Everything a pipeline needs, shared by reference for the whole run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub ledger: Ledger,
    pub gate: PauseGate,
    pub progress: ProgressChannel,
    pub store: Arc<Storage>,
    pub policy: PipelinePolicy,
}

/// A seeded, persisted run whose pipelines have not started yet.
pub struct PreparedRun {
    ctx: Arc<RunContext>,
    factories: Vec<Arc<dyn SessionFactory>>,
    planned: usize,
    started: Instant,
}

impl PreparedRun {
    pub fn run_id(&self) -> &RunId {
        &self.ctx.run_id
    }

    /// Slots of the selected sources that are not already `Found`, i.e. the
    /// number of `ItemUpdate` events the run will produce.
    pub fn planned_lookups(&self) -> usize {
        self.planned
    }
}

impl std::fmt::Debug for PreparedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRun")
            .field("run_id", &self.ctx.run_id)
            .field("sources", &self.factories.iter().map(|f| f.source()).collect::<Vec<_>>())
            .finish()
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    /// Reports in source selection order.
    pub reports: Vec<PipelineReport>,
    /// Per-source slot counts after the run.
    pub stats: BTreeMap<SourceName, SourceStats>,
    pub snapshot: LedgerSnapshot,
    pub elapsed: Duration,
    pub message: String,
}

/// Runs pipelines against a shared ledger.
#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: SourceRegistry,
    consolidator: Consolidator,
    store: Arc<Storage>,
    gate: PauseGate,
    progress: ProgressChannel,
    policy: PipelinePolicy,
}

impl Supervisor {
    pub fn new(
        registry: SourceRegistry,
        store: Arc<Storage>,
        policy: PipelinePolicy,
        gate: PauseGate,
        progress: ProgressChannel,
    ) -> Self {
        Self {
            registry,
            consolidator: Consolidator::new(store.clone()),
            store,
            gate,
            progress,
            policy,
        }
    }

    pub fn progress(&self) -> &ProgressChannel {
        &self.progress
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    /// Setup, pipelines and consolidation in one call.
    pub async fn run_all(&self, config: &RunConfig, items: Vec<Item>) -> Result<RunOutcome> {
        let prepared = self.prepare(config, items).await?;
        Ok(self.execute(prepared).await)
    }

    /// Validate, seed and persist the ledger for a new run.
    ///
    /// Any error here is a setup error: no pipeline has started, and a
    /// `Terminal` event has been emitted.
    #[instrument(skip_all, fields(sources = config.sources.len(), force_rescan = config.force_rescan))]
    pub async fn prepare(&self, config: &RunConfig, items: Vec<Item>) -> Result<PreparedRun> {
        match self.try_prepare(config, items).await {
            Ok(prepared) => Ok(prepared),
            Err(e) => {
                self.report_setup_failure(&e);
                Err(e)
            }
        }
    }

    /// Announce a run that failed before any pipeline started: an error log
    /// followed by the run's single `Terminal` event.
    pub fn report_setup_failure(&self, e: &PricewatchError) {
        warn!(error = %e, "run setup failed");
        self.progress.log(LogLevel::Error, None, e.to_string());
        self.progress.terminal(RunState::Failed, e.to_string());
    }

    async fn try_prepare(&self, config: &RunConfig, items: Vec<Item>) -> Result<PreparedRun> {
        let factories = self.select(&config.sources)?;
        if items.is_empty() {
            return Err(PricewatchError::setup("no items to look up"));
        }

        let prior = if config.force_rescan {
            None
        } else {
            self.consolidator.load_prior().await.map_err(|e| {
                PricewatchError::setup(format!("could not read the stored ledger: {e}"))
            })?
        };

        let ledger = Ledger::seed(
            &self.registry.names(),
            items,
            prior.as_ref(),
            config.force_rescan,
        )?;

        self.consolidator.persist(&ledger).await.map_err(|e| {
            PricewatchError::setup(format!("could not persist the seeded ledger: {e}"))
        })?;

        let run_id = RunId::new();
        let selected: Vec<SourceName> = factories.iter().map(|f| f.source().clone()).collect();
        if let Err(e) = self
            .store
            .insert_run(&run_id, &selected, config.force_rescan)
            .await
        {
            warn!(error = %e, "could not record run start");
        }

        self.gate.resume();

        let ctx = Arc::new(RunContext {
            run_id,
            ledger,
            gate: self.gate.clone(),
            progress: self.progress.clone(),
            store: self.store.clone(),
            policy: self.policy.clone(),
        });

        let names: Vec<&str> = selected.iter().map(SourceName::as_str).collect();
        info!(run = %ctx.run_id, sources = ?names, "run prepared");
        self.progress.log(
            LogLevel::Info,
            None,
            format!("run {} started with sources: {}", ctx.run_id, names.join(", ")),
        );
        for (index, item) in ctx.ledger.items().await.iter().enumerate() {
            self.progress.item_init(index, item);
        }

        let mut planned = 0;
        for source in &selected {
            let stats = ctx.ledger.stats(source).await;
            planned += stats.total() - stats.found;
        }

        Ok(PreparedRun {
            ctx,
            factories,
            planned,
            started: Instant::now(),
        })
    }

    /// Resolve the requested sources against the registry, keeping request
    /// order and dropping repeats.
    fn select(&self, requested: &[SourceName]) -> Result<Vec<Arc<dyn SessionFactory>>> {
        if requested.is_empty() {
            return Err(PricewatchError::setup("no sources selected"));
        }
        let mut seen = HashSet::new();
        let mut factories = Vec::new();
        for name in requested {
            if !seen.insert(name) {
                continue;
            }
            let factory = self
                .registry
                .get(name)
                .ok_or_else(|| PricewatchError::setup(format!("unknown source '{name}'")))?;
            factories.push(factory);
        }
        Ok(factories)
    }

    /// Run every pipeline of a prepared run to completion and consolidate.
    #[instrument(skip_all, fields(run = %run.ctx.run_id))]
    pub async fn execute(&self, run: PreparedRun) -> RunOutcome {
        let PreparedRun {
            ctx,
            factories,
            started,
            ..
        } = run;
        let order: Vec<SourceName> = factories.iter().map(|f| f.source().clone()).collect();

        let mut set: JoinSet<(SourceName, std::result::Result<PipelineReport, JoinError>)> =
            JoinSet::new();
        for factory in factories {
            let ctx = ctx.clone();
            let source = factory.source().clone();
            // The inner task isolates a panicking pipeline from the join loop.
            set.spawn(async move {
                let joined = tokio::spawn(pipeline::run(ctx, factory)).await;
                (source, joined)
            });
        }

        let mut reports = Vec::with_capacity(order.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((source, Err(e))) => reports.push(contain(&ctx, &source, e).await),
                Err(e) => error!(error = %e, "pipeline wrapper task failed"),
            }
        }
        reports.sort_by_key(|r| order.iter().position(|s| *s == r.source));

        let mut stats = BTreeMap::new();
        for source in ctx.ledger.sources().await {
            let s = ctx.ledger.stats(&source).await;
            stats.insert(source, s);
        }

        let (state, snapshot, message) = match self.consolidator.persist(&ctx.ledger).await {
            Ok(snapshot) => (RunState::Completed, snapshot, summary(&reports)),
            Err(e) => {
                error!(error = %e, "final ledger persist failed");
                (
                    RunState::Failed,
                    ctx.ledger.snapshot().await,
                    format!("results could not be saved: {e}"),
                )
            }
        };

        let stats_json = serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string());
        if let Err(e) = self.store.finish_run(&ctx.run_id, state, &stats_json).await {
            warn!(error = %e, "could not record run end");
        }

        let elapsed = started.elapsed();
        info!(%state, elapsed_ms = elapsed.as_millis() as u64, "run finished");
        self.progress.terminal(state, message.clone());

        RunOutcome {
            run_id: ctx.run_id.clone(),
            state,
            reports,
            stats,
            snapshot,
            elapsed,
            message,
        }
    }
}

/// A pipeline task died (panic). Its untouched items become `Error`.
async fn contain(ctx: &RunContext, source: &SourceName, e: JoinError) -> PipelineReport {
    error!(%source, error = %e, "pipeline crashed");
    ctx.progress.log(
        LogLevel::Error,
        Some(source),
        format!("pipeline crashed: {e}"),
    );

    let mut report = PipelineReport::new(source.clone());
    report.aborted = true;
    for (index, key) in ctx.ledger.keys_with_status(source, LookupStatus::Pending).await {
        if ctx.ledger.set(&key, source, SourceResult::error()).await.is_ok() {
            report.errors += 1;
            ctx.progress
                .item_update(index, &key, source, SourceResult::error());
        }
    }
    report
}

fn summary(reports: &[PipelineReport]) -> String {
    let found: usize = reports.iter().map(|r| r.found).sum();
    let not_found: usize = reports.iter().map(|r| r.not_found).sum();
    let errors: usize = reports.iter().map(|r| r.errors).sum();
    let aborted = reports.iter().filter(|r| r.aborted).count();
    let mut message =
        format!("run completed: {found} found, {not_found} not found, {errors} errors");
    if aborted > 0 {
        message.push_str(&format!(" ({aborted} source(s) stopped early)"));
    }
    message
}
