//! The lookup contract between the orchestration core and price sources.
//!
//! A source hands out *sessions* (a browser tab, a logged-in HTTP client, ...)
//! through a [`SessionFactory`]. A session resolves one item key at a time.
//! Failures are classified so the pipeline can tell "this item failed" apart
//! from "this session is unusable".

use async_trait::async_trait;
use pricewatch_shared::{LookupStatus, SourceName, SourceResult};

/// Why a single lookup (or a session acquisition) did not produce a price.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The source answered and has no such item. The session is still usable.
    #[error("item not found")]
    NotFound,

    /// This item failed (bad page, unexpected status). The session is still usable.
    #[error("lookup failed: {0}")]
    Failed(String),

    /// The source did not answer in time. Recorded with the source's
    /// timeout status, like a pipeline timeout.
    #[error("lookup timed out: {0}")]
    TimedOut(String),

    /// The session is unusable and must be replaced.
    #[error("session died: {0}")]
    SessionDied(String),

    /// A session could not be opened at all.
    #[error("could not acquire session: {0}")]
    Acquire(String),
}

impl LookupError {
    /// Status recorded on the ledger for an item that hit this error.
    pub fn status(&self) -> LookupStatus {
        match self {
            Self::NotFound | Self::TimedOut(_) => LookupStatus::NotFound,
            Self::Failed(_) | Self::SessionDied(_) | Self::Acquire(_) => LookupStatus::Error,
        }
    }

    /// Whether the session that produced this error must be discarded.
    pub fn kills_session(&self) -> bool {
        matches!(self, Self::SessionDied(_))
    }
}

/// One lookup-capable resource handle.
#[async_trait]
pub trait LookupSession: Send {
    /// Resolve one item key against the source.
    async fn lookup(&mut self, key: &str) -> Result<SourceResult, LookupError>;

    /// Release the underlying resource. Called once, when the pipeline is done
    /// with the session or after it died.
    async fn close(&mut self) {}
}

/// Opens lookup sessions for one source.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// The source this factory serves.
    fn source(&self) -> &SourceName;

    /// Open a new session. May be slow (browser start, login).
    async fn acquire(&self) -> Result<Box<dyn LookupSession>, LookupError>;

    /// Status recorded when a lookup exceeds the pipeline timeout.
    fn timeout_status(&self) -> LookupStatus {
        LookupStatus::NotFound
    }
}
