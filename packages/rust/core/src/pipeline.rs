//! Source pipeline: walks the ledger for one source, one item at a time.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use pricewatch_lookup::{LookupError, LookupSession, SessionFactory};
use pricewatch_shared::{LookupStatus, SourceName, SourceResult};

use crate::progress::LogLevel;
use crate::supervisor::RunContext;

/// What one pipeline did during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub source: SourceName,
    /// Lookups issued (including those that timed out or failed).
    pub attempted: usize,
    pub found: usize,
    pub not_found: usize,
    /// Items that ended as `Error`, including those failed without a lookup
    /// because no session could be obtained.
    pub errors: usize,
    /// Items skipped because they were already `Found`.
    pub skipped: usize,
    pub session_restarts: usize,
    /// The pipeline gave up early (acquisition failure or panic).
    pub aborted: bool,
}

impl PipelineReport {
    pub fn new(source: SourceName) -> Self {
        Self {
            source,
            attempted: 0,
            found: 0,
            not_found: 0,
            errors: 0,
            skipped: 0,
            session_restarts: 0,
            aborted: false,
        }
    }

    fn record(&mut self, status: LookupStatus) {
        match status {
            LookupStatus::Found => self.found += 1,
            LookupStatus::NotFound => self.not_found += 1,
            LookupStatus::Error => self.errors += 1,
            LookupStatus::Pending => {}
        }
    }
}

/// Run the pipeline for `factory`'s source to completion.
///
/// Per-item and per-session failures end up as ledger statuses; this never
/// fails.
#[instrument(skip_all, fields(run = %ctx.run_id, source = %factory.source()))]
pub async fn run(ctx: Arc<RunContext>, factory: Arc<dyn SessionFactory>) -> PipelineReport {
    let source = factory.source().clone();
    let mut report = PipelineReport::new(source.clone());
    let keys = ctx.ledger.keys().await;

    info!(items = keys.len(), "pipeline started");
    ctx.progress
        .log(LogLevel::Info, Some(&source), "pipeline started");

    let Some(mut session) = acquire(&ctx, factory.as_ref()).await else {
        fail_remaining(&ctx, &source, &keys, 0, &mut report).await;
        return report;
    };

    for (index, key) in keys.iter().enumerate() {
        if ctx.gate.wait_until_running().await {
            debug!("resumed");
        }

        if !ctx.ledger.needs_lookup(key, &source).await {
            report.skipped += 1;
            continue;
        }

        report.attempted += 1;
        let (result, died) =
            match tokio::time::timeout(ctx.policy.lookup_timeout, session.lookup(key)).await {
                Ok(Ok(result)) => (result, None),
                Ok(Err(LookupError::TimedOut(reason))) => {
                    warn!(%key, %reason, "lookup timed out in source");
                    ctx.progress.log(
                        LogLevel::Warn,
                        Some(&source),
                        format!("{key}: timed out"),
                    );
                    (SourceResult::with_status(factory.timeout_status()), None)
                }
                Ok(Err(e)) => {
                    if !matches!(e, LookupError::NotFound) {
                        warn!(%key, error = %e, "lookup failed");
                        ctx.progress
                            .log(LogLevel::Warn, Some(&source), format!("{key}: {e}"));
                    }
                    let died = e.kills_session().then(|| e.to_string());
                    (SourceResult::with_status(e.status()), died)
                }
                Err(_) => {
                    warn!(%key, timeout = ?ctx.policy.lookup_timeout, "lookup timed out");
                    ctx.progress.log(
                        LogLevel::Warn,
                        Some(&source),
                        format!("{key}: timed out"),
                    );
                    (SourceResult::with_status(factory.timeout_status()), None)
                }
            };

        write(&ctx, &source, index, key, result, &mut report).await;

        if let Some(reason) = died {
            session.close().await;
            report.session_restarts += 1;
            warn!(%reason, "session died, reacquiring");
            ctx.progress.log(
                LogLevel::Warn,
                Some(&source),
                format!("session died ({reason}); starting a new one"),
            );
            match acquire(&ctx, factory.as_ref()).await {
                Some(fresh) => session = fresh,
                None => {
                    fail_remaining(&ctx, &source, &keys, index + 1, &mut report).await;
                    return report;
                }
            }
        }
    }

    session.close().await;

    info!(
        attempted = report.attempted,
        found = report.found,
        not_found = report.not_found,
        errors = report.errors,
        skipped = report.skipped,
        "pipeline finished"
    );
    ctx.progress.log(
        LogLevel::Info,
        Some(&source),
        format!(
            "finished: {} found, {} not found, {} errors, {} skipped",
            report.found, report.not_found, report.errors, report.skipped
        ),
    );
    report
}

/// Open a session, retrying up to `acquire_attempts` times.
async fn acquire(ctx: &RunContext, factory: &dyn SessionFactory) -> Option<Box<dyn LookupSession>> {
    let attempts = ctx.policy.acquire_attempts.max(1);
    for attempt in 1..=attempts {
        match factory.acquire().await {
            Ok(session) => return Some(session),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "session acquisition failed");
                ctx.progress.log(
                    LogLevel::Warn,
                    Some(factory.source()),
                    format!("could not open session (attempt {attempt}/{attempts}): {e}"),
                );
                if attempt < attempts {
                    tokio::time::sleep(ctx.policy.acquire_backoff).await;
                }
            }
        }
    }
    None
}

/// Mark every item from `start` on that still needs a lookup as `Error`.
async fn fail_remaining(
    ctx: &RunContext,
    source: &SourceName,
    keys: &[String],
    start: usize,
    report: &mut PipelineReport,
) {
    report.aborted = true;
    ctx.progress.log(
        LogLevel::Error,
        Some(source),
        "no session available; remaining items marked as errors",
    );
    for (index, key) in keys.iter().enumerate().skip(start) {
        if ctx.ledger.needs_lookup(key, source).await {
            write(ctx, source, index, key, SourceResult::error(), report).await;
        }
    }
}

async fn write(
    ctx: &RunContext,
    source: &SourceName,
    index: usize,
    key: &str,
    result: SourceResult,
    report: &mut PipelineReport,
) {
    report.record(result.status);
    if let Err(e) = ctx.ledger.set(key, source, result.clone()).await {
        warn!(%key, error = %e, "ledger rejected result");
        return;
    }
    ctx.progress.item_update(index, key, source, result);
}
