//! In-memory lookup fakes for orchestration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use pricewatch_lookup::{LookupError, LookupSession, SessionFactory, SourceRegistry};
use pricewatch_shared::{Item, LookupStatus, PipelinePolicy, RunId, SourceName, SourceResult};
use pricewatch_storage::Storage;

use crate::gate::PauseGate;
use crate::ledger::Ledger;
use crate::progress::ProgressChannel;
use crate::supervisor::RunContext;

/// Scripted behaviour for one item key. Unscripted keys are found with
/// primary value `"<source>:<key>"`.
#[derive(Debug, Clone)]
pub enum Script {
    Fail(LookupError),
    Die,
    Hang,
    Panic,
}

#[derive(Debug, Default)]
struct Records {
    acquisitions: usize,
    /// `(key, session number)` per lookup, in call order.
    lookups: Vec<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct FakeSource {
    name: SourceName,
    scripts: HashMap<String, Script>,
    failing_acquisitions: usize,
    max_sessions: usize,
    delay: Duration,
    timeout_status: LookupStatus,
    records: Arc<Mutex<Records>>,
}

impl FakeSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: SourceName::new(name),
            scripts: HashMap::new(),
            failing_acquisitions: 0,
            max_sessions: usize::MAX,
            delay: Duration::ZERO,
            timeout_status: LookupStatus::NotFound,
            records: Arc::default(),
        }
    }

    pub fn script(mut self, key: &str, script: Script) -> Self {
        self.scripts.insert(key.to_string(), script);
        self
    }

    /// The first `n` acquisitions fail.
    pub fn failing_acquisitions(mut self, n: usize) -> Self {
        self.failing_acquisitions = n;
        self
    }

    /// Acquisitions after the first `n` successful ones fail.
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = n;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn timeout_status(mut self, status: LookupStatus) -> Self {
        self.timeout_status = status;
        self
    }

    pub fn name(&self) -> SourceName {
        self.name.clone()
    }

    pub fn factory(&self) -> Arc<dyn SessionFactory> {
        Arc::new(self.clone())
    }

    pub fn acquisitions(&self) -> usize {
        self.records.lock().unwrap().acquisitions
    }

    pub fn looked_up(&self) -> Vec<String> {
        let records = self.records.lock().unwrap();
        records.lookups.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Session numbers (1-based) that looked up `key`.
    pub fn sessions_for(&self, key: &str) -> Vec<usize> {
        let records = self.records.lock().unwrap();
        records
            .lookups
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl SessionFactory for FakeSource {
    fn source(&self) -> &SourceName {
        &self.name
    }

    async fn acquire(&self) -> Result<Box<dyn LookupSession>, LookupError> {
        let mut records = self.records.lock().unwrap();
        records.acquisitions += 1;
        let attempt = records.acquisitions;
        if attempt <= self.failing_acquisitions {
            return Err(LookupError::Acquire("driver unavailable".into()));
        }
        let session_number = attempt - self.failing_acquisitions.min(attempt);
        if session_number > self.max_sessions {
            return Err(LookupError::Acquire("no more sessions".into()));
        }
        Ok(Box::new(FakeSession {
            source: self.clone(),
            number: attempt,
        }))
    }

    fn timeout_status(&self) -> LookupStatus {
        self.timeout_status
    }
}

struct FakeSession {
    source: FakeSource,
    number: usize,
}

#[async_trait]
impl LookupSession for FakeSession {
    async fn lookup(&mut self, key: &str) -> Result<SourceResult, LookupError> {
        self.source
            .records
            .lock()
            .unwrap()
            .lookups
            .push((key.to_string(), self.number));

        if !self.source.delay.is_zero() {
            tokio::time::sleep(self.source.delay).await;
        }

        match self.source.scripts.get(key) {
            None => Ok(SourceResult::found(
                format!("{}:{key}", self.source.name),
                "",
                "",
            )),
            Some(Script::Fail(e)) => Err(e.clone()),
            Some(Script::Die) => Err(LookupError::SessionDied("tab crashed".into())),
            Some(Script::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(LookupError::Failed("hung".into()))
            }
            Some(Script::Panic) => panic!("lookup blew up on {key}"),
        }
    }
}

/// Fast timings for tests.
pub fn test_policy() -> PipelinePolicy {
    PipelinePolicy {
        lookup_timeout: Duration::from_millis(100),
        acquire_attempts: 2,
        acquire_backoff: Duration::from_millis(5),
        progress_capacity: 1024,
        heartbeat: Duration::from_millis(50),
    }
}

pub async fn temp_storage() -> Arc<Storage> {
    let path = std::env::temp_dir().join(format!("pw_core_{}.db", Uuid::now_v7()));
    Arc::new(Storage::open(&path).await.expect("open temp storage"))
}

pub fn registry(sources: &[&FakeSource]) -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in sources {
        registry.register(source.factory()).expect("unique fake names");
    }
    registry
}

/// A run context over a freshly seeded ledger.
pub async fn test_context(sources: &[&FakeSource], items: Vec<Item>) -> Arc<RunContext> {
    let names: Vec<SourceName> = sources.iter().map(|s| s.name()).collect();
    let policy = test_policy();
    Arc::new(RunContext {
        run_id: RunId::new(),
        ledger: Ledger::seed(&names, items, None, false).expect("seed"),
        gate: PauseGate::new(),
        progress: ProgressChannel::new(policy.progress_capacity),
        store: temp_storage().await,
        policy,
    })
}
