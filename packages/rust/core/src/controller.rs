//! Run controller: the start/pause/resume/reset control surface.
//!
//! Liveness is structural. A run is live while the controller's state is
//! `Running`; the state leaves `Running` only after the run task has
//! actually finished (checked with `JoinHandle::is_finished`). There is no
//! age heuristic.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use pricewatch_lookup::SourceRegistry;
use pricewatch_shared::{Item, PipelinePolicy, PricewatchError, Result, RunId, RunState};
use pricewatch_storage::Storage;

use crate::gate::PauseGate;
use crate::input::load_items;
use crate::progress::{LogLevel, ProgressChannel, ProgressSubscription};
use crate::supervisor::{RunConfig, RunOutcome, Supervisor};

/// Point-in-time view of the controller.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub state: RunState,
    pub run_id: Option<RunId>,
    /// Time since the current (or last) run started.
    pub elapsed: Option<Duration>,
    pub paused: bool,
    /// Lookups the current (or last) run set out to do.
    pub planned_lookups: usize,
}

struct Inner {
    supervisor: Supervisor,
    state: RunState,
    run_id: Option<RunId>,
    started_at: Option<Instant>,
    planned_lookups: usize,
    /// Held until the run task has been joined.
    task: Option<JoinHandle<RunOutcome>>,
    /// Flips to `true` when the run task is about to return.
    finished: Option<watch::Receiver<bool>>,
    last: Option<RunOutcome>,
    /// Why the last run produced no outcome (setup error or a crashed task).
    failure: Option<String>,
}

pub struct Controller {
    registry: SourceRegistry,
    store: Arc<Storage>,
    policy: PipelinePolicy,
    gate: PauseGate,
    items_file: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .field("items_file", &self.items_file)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(registry: SourceRegistry, store: Arc<Storage>, policy: PipelinePolicy) -> Self {
        let gate = PauseGate::new();
        let supervisor = Supervisor::new(
            registry.clone(),
            store.clone(),
            policy.clone(),
            gate.clone(),
            ProgressChannel::new(policy.progress_capacity),
        );
        Self {
            registry,
            store,
            policy,
            gate,
            items_file: None,
            inner: Mutex::new(Inner {
                supervisor,
                state: RunState::NotStarted,
                run_id: None,
                started_at: None,
                planned_lookups: 0,
                task: None,
                finished: None,
                last: None,
                failure: None,
            }),
        }
    }

    /// Default item list used when a run request carries no items.
    pub fn with_items_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.items_file = Some(path.into());
        self
    }

    /// Start a run in the background.
    ///
    /// Setup failures, including unreadable or missing input, are returned
    /// here and also sent as the run's `Terminal` event. Refused with
    /// `RunInProgress` while another run is live.
    pub async fn start(&self, mut config: RunConfig) -> Result<RunId> {
        let mut inner = self.inner.lock().await;
        refresh(&mut inner).await;
        if inner.state == RunState::Running {
            return Err(in_progress(&inner));
        }

        let prepared = match self.resolve_items(config.items.take()) {
            Ok(items) => inner.supervisor.prepare(&config, items).await,
            Err(e) => {
                inner.supervisor.report_setup_failure(&e);
                Err(e)
            }
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                inner.state = RunState::Failed;
                inner.last = None;
                inner.failure = Some(e.to_string());
                return Err(e);
            }
        };

        let run_id = prepared.run_id().clone();
        let planned = prepared.planned_lookups();
        let supervisor = inner.supervisor.clone();
        let (done_tx, done_rx) = watch::channel(false);
        inner.task = Some(tokio::spawn(async move {
            let outcome = supervisor.execute(prepared).await;
            let _ = done_tx.send(true);
            outcome
        }));
        inner.finished = Some(done_rx);
        inner.state = RunState::Running;
        inner.run_id = Some(run_id.clone());
        inner.started_at = Some(Instant::now());
        inner.planned_lookups = planned;
        inner.last = None;
        inner.failure = None;

        info!(run = %run_id, planned, "run started");
        Ok(run_id)
    }

    fn resolve_items(&self, items: Option<Vec<Item>>) -> Result<Vec<Item>> {
        match (items, &self.items_file) {
            (Some(items), _) => Ok(items),
            (None, Some(path)) => load_items(path)
                .map_err(|e| PricewatchError::setup(format!("could not read items: {e}"))),
            (None, None) => Err(PricewatchError::setup("no input data supplied")),
        }
    }

    /// Hold every pipeline before its next item.
    pub async fn pause(&self) {
        if self.gate.pause() {
            let inner = self.inner.lock().await;
            inner
                .supervisor
                .progress()
                .log(LogLevel::Info, None, "paused");
        }
    }

    pub async fn resume(&self) {
        if self.gate.resume() {
            let inner = self.inner.lock().await;
            inner
                .supervisor
                .progress()
                .log(LogLevel::Info, None, "resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Forget the last run and replace the progress channel; existing
    /// subscriptions end. Refused while a run is live.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        refresh(&mut inner).await;
        if inner.state == RunState::Running {
            return Err(in_progress(&inner));
        }

        inner.supervisor = Supervisor::new(
            self.registry.clone(),
            self.store.clone(),
            self.policy.clone(),
            self.gate.clone(),
            ProgressChannel::new(self.policy.progress_capacity),
        );
        inner.state = RunState::NotStarted;
        inner.run_id = None;
        inner.started_at = None;
        inner.planned_lookups = 0;
        inner.finished = None;
        inner.last = None;
        inner.failure = None;
        self.gate.resume();
        info!("controller reset");
        Ok(())
    }

    /// Subscribe to progress. Subscribe before `start` to see every event
    /// of the run.
    pub async fn subscribe(&self) -> ProgressSubscription {
        self.inner.lock().await.supervisor.progress().subscribe()
    }

    pub async fn status(&self) -> ControllerStatus {
        let mut inner = self.inner.lock().await;
        refresh(&mut inner).await;
        ControllerStatus {
            state: inner.state,
            run_id: inner.run_id.clone(),
            elapsed: inner.started_at.map(|t| t.elapsed()),
            paused: self.gate.is_paused(),
            planned_lookups: inner.planned_lookups,
        }
    }

    /// Wait for the current run to finish and return its outcome. Returns
    /// the last outcome if the run already finished.
    ///
    /// Cancel-safe: dropping the returned future leaves the run and the
    /// controller state untouched.
    pub async fn wait(&self) -> Result<RunOutcome> {
        let finished = {
            let mut inner = self.inner.lock().await;
            refresh(&mut inner).await;
            match (&inner.task, &inner.finished) {
                (Some(_), Some(finished)) => Some(finished.clone()),
                _ => None,
            }
        };

        if let Some(mut finished) = finished {
            // An error means the task ended without signalling; joining it
            // below reports why.
            let _ = finished.wait_for(|done| *done).await;
        }

        let mut inner = self.inner.lock().await;
        settle(&mut inner).await;
        if let Some(outcome) = &inner.last {
            return Ok(outcome.clone());
        }
        Err(match (inner.state, &inner.failure) {
            (RunState::Running, _) => in_progress(&inner),
            (RunState::Failed, Some(reason)) => PricewatchError::Run(reason.clone()),
            _ => PricewatchError::validation("no run has been started"),
        })
    }
}

/// Settle a finished run task into the controller state.
async fn refresh(inner: &mut Inner) {
    if inner.task.as_ref().is_some_and(|t| t.is_finished()) {
        settle(inner).await;
    }
}

/// Join the run task and record its result. The handle stays in place until
/// the join completes.
async fn settle(inner: &mut Inner) {
    let Some(task) = inner.task.as_mut() else {
        return;
    };
    let joined = task.await;
    inner.task = None;
    inner.finished = None;
    match joined {
        Ok(outcome) => {
            inner.state = outcome.state;
            inner.last = Some(outcome);
        }
        Err(e) => {
            warn!(error = %e, "run task failed");
            inner.state = RunState::Failed;
            inner.failure = Some(e.to_string());
        }
    }
}

fn in_progress(inner: &Inner) -> PricewatchError {
    PricewatchError::RunInProgress {
        elapsed_secs: inner.started_at.map(|t| t.elapsed().as_secs()).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_shared::{Item, LookupStatus, SourceName};

    use crate::progress::EventKind;
    use crate::testing::{FakeSource, registry, temp_storage, test_policy};

    const TICK: Duration = Duration::from_millis(200);

    async fn controller(sources: &[&FakeSource]) -> Controller {
        Controller::new(registry(sources), temp_storage().await, test_policy())
    }

    fn terminals(sub: &mut ProgressSubscription) -> usize {
        let mut count = 0;
        while let Some(event) = sub.try_next() {
            if event.is_terminal() {
                count += 1;
            }
        }
        count
    }

    fn request(sources: &[&FakeSource], keys: &[&str]) -> RunConfig {
        RunConfig {
            sources: sources.iter().map(|s| s.name()).collect(),
            force_rescan: false,
            items: Some(keys.iter().map(|k| Item::new(*k, "", "")).collect()),
        }
    }

    #[tokio::test]
    async fn start_and_wait() {
        let a = FakeSource::new("a");
        let ctl = controller(&[&a]).await;
        assert_eq!(ctl.status().await.state, RunState::NotStarted);

        let run_id = ctl.start(request(&[&a], &["1", "2"])).await.unwrap();
        let outcome = ctl.wait().await.unwrap();

        assert_eq!(outcome.run_id, run_id);
        assert_eq!(outcome.state, RunState::Completed);
        let status = ctl.status().await;
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.run_id, Some(run_id));

        // Waiting again returns the same outcome.
        assert_eq!(ctl.wait().await.unwrap().run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn second_start_and_reset_refused_while_live() {
        let a = FakeSource::new("a").delay(Duration::from_millis(200));
        let ctl = controller(&[&a]).await;
        ctl.pause().await;

        ctl.start(request(&[&a], &["1"])).await.unwrap();

        let err = ctl.start(request(&[&a], &["1"])).await.unwrap_err();
        assert!(matches!(err, PricewatchError::RunInProgress { .. }));
        let err = ctl.reset().await.unwrap_err();
        assert!(matches!(err, PricewatchError::RunInProgress { .. }));

        // Starting a run resets the gate to Running.
        assert!(!ctl.is_paused());
        ctl.wait().await.unwrap();
        ctl.reset().await.unwrap();
        assert_eq!(ctl.status().await.state, RunState::NotStarted);
    }

    #[tokio::test]
    async fn setup_errors_are_synchronous() {
        let a = FakeSource::new("a");
        let ctl = controller(&[&a]).await;
        let mut sub = ctl.subscribe().await;

        let err = ctl
            .start(RunConfig {
                sources: vec![],
                force_rescan: false,
                items: Some(vec![Item::new("1", "", "")]),
            })
            .await
            .unwrap_err();
        assert!(err.is_setup());
        assert_eq!(ctl.status().await.state, RunState::Failed);

        let mut saw_terminal = false;
        while let Some(event) = sub.try_next() {
            saw_terminal |= event.is_terminal();
        }
        assert!(saw_terminal);

        let err = ctl
            .start(RunConfig {
                sources: vec![a.name()],
                ..RunConfig::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_setup(), "no items and no items file");
        assert_eq!(terminals(&mut sub), 1);
        assert_eq!(ctl.status().await.state, RunState::Failed);
    }

    #[tokio::test]
    async fn unreadable_items_file_ends_the_run() {
        let a = FakeSource::new("a");
        let ctl = controller(&[&a])
            .await
            .with_items_file("/nonexistent/items.json");
        let mut sub = ctl.subscribe().await;

        let err = ctl
            .start(RunConfig {
                sources: vec![a.name()],
                ..RunConfig::default()
            })
            .await
            .unwrap_err();

        assert!(err.is_setup());
        assert!(err.to_string().contains("could not read items"));
        assert_eq!(terminals(&mut sub), 1);
        assert_eq!(ctl.status().await.state, RunState::Failed);
        assert!(a.looked_up().is_empty());
        assert!(matches!(ctl.wait().await, Err(PricewatchError::Run(_))));
    }

    #[tokio::test]
    async fn abandoned_wait_keeps_the_run_tracked() {
        let a = FakeSource::new("a").delay(Duration::from_millis(50));
        let ctl = controller(&[&a]).await;
        let run_id = ctl.start(request(&[&a], &["1", "2", "3"])).await.unwrap();

        let early = tokio::time::timeout(Duration::from_millis(20), ctl.wait()).await;
        assert!(early.is_err(), "run should still be going");
        assert_eq!(ctl.status().await.state, RunState::Running);

        let outcome = ctl.wait().await.unwrap();
        assert_eq!(outcome.run_id, run_id);
        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(ctl.status().await.state, RunState::Completed);
        ctl.reset().await.unwrap();
    }

    #[tokio::test]
    async fn status_reports_planned_lookups() {
        let a = FakeSource::new("a");
        let b = FakeSource::new("b");
        let ctl = controller(&[&a, &b]).await;

        ctl.start(request(&[&a, &b], &["1", "2"])).await.unwrap();
        assert_eq!(ctl.status().await.planned_lookups, 4);
        ctl.wait().await.unwrap();

        // Everything is found now; a re-run only checks b's new item.
        ctl.start(request(&[&b], &["1", "2", "3"])).await.unwrap();
        assert_eq!(ctl.status().await.planned_lookups, 1);
        ctl.wait().await.unwrap();
        assert_eq!(b.looked_up(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn pause_stops_new_writes_until_resume() {
        let a = FakeSource::new("a").delay(Duration::from_millis(40));
        let b = FakeSource::new("b").delay(Duration::from_millis(40));
        let ctl = controller(&[&a, &b]).await;
        let mut sub = ctl.subscribe().await;

        ctl.start(request(&[&a, &b], &["1", "2", "3", "4", "5"]))
            .await
            .unwrap();

        // Let a couple of items through, then pause.
        loop {
            let event = sub.next_event(TICK).await.unwrap();
            if matches!(event.kind, EventKind::ItemUpdate { .. }) {
                break;
            }
        }
        ctl.pause().await;

        // In-flight lookups may still land; after that, nothing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let settled = a.looked_up().len() + b.looked_up().len();
        while sub.try_next().is_some() {}
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(a.looked_up().len() + b.looked_up().len(), settled);
        let mut new_updates = 0;
        while let Some(event) = sub.try_next() {
            if matches!(event.kind, EventKind::ItemUpdate { .. }) {
                new_updates += 1;
            }
        }
        assert_eq!(new_updates, 0);
        assert_eq!(ctl.status().await.state, RunState::Running);

        ctl.resume().await;
        let outcome = ctl.wait().await.unwrap();
        for source in [a.name(), b.name()] {
            assert_eq!(outcome.snapshot.count(&source, LookupStatus::Found), 5);
        }
    }

    #[tokio::test]
    async fn reset_ends_old_subscriptions() {
        let a = FakeSource::new("a");
        let ctl = controller(&[&a]).await;
        let mut old = ctl.subscribe().await;

        ctl.reset().await.unwrap();

        assert!(old.next_event(TICK).await.is_none());
        let mut fresh = ctl.subscribe().await;
        ctl.start(request(&[&a], &["1"])).await.unwrap();
        ctl.wait().await.unwrap();
        let mut terminal = false;
        while let Some(event) = fresh.try_next() {
            terminal |= event.is_terminal();
        }
        assert!(terminal);
    }

    #[tokio::test]
    async fn items_file_is_the_default_input() {
        let a = FakeSource::new("a");
        let ctl = controller(&[&a])
            .await
            .with_items_file("../../../fixtures/json/items.fixture.json");

        ctl.start(RunConfig {
            sources: vec![SourceName::new("a")],
            ..RunConfig::default()
        })
        .await
        .unwrap();
        let outcome = ctl.wait().await.unwrap();
        assert_eq!(outcome.snapshot.rows.len(), 3);
        assert_eq!(a.looked_up()[0], "7790387000018");
    }
}
