//! Progress channel: a best-effort, ordered event stream for run observers.
//!
//! Producers never block. With no subscriber an event is simply dropped; a
//! subscriber that falls behind loses the oldest events and is told how many
//! it missed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use pricewatch_shared::{Item, RunState, SourceName, SourceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Log {
        level: LogLevel,
        source: Option<SourceName>,
        message: String,
    },
    /// Announces one ledger row before the pipelines start.
    ItemInit {
        index: usize,
        key: String,
        code: String,
        description: String,
    },
    ItemUpdate {
        index: usize,
        key: String,
        source: SourceName,
        result: SourceResult,
    },
    /// Nothing happened within the subscriber's timeout.
    Heartbeat,
    /// The run is over. Emitted exactly once per run.
    Terminal {
        state: RunState,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Channel-wide sequence number. Synthesized events (heartbeats, lag
    /// warnings) repeat the last sequence number the subscriber saw.
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Terminal { .. })
    }
}

#[derive(Debug)]
struct Inner {
    sender: broadcast::Sender<ProgressEvent>,
    next_seq: Mutex<u64>,
}

/// Fan-out event channel shared by the supervisor and every pipeline.
#[derive(Debug, Clone)]
pub struct ProgressChannel {
    inner: Arc<Inner>,
}

impl ProgressChannel {
    /// `capacity` bounds how far a subscriber may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            receiver: self.inner.sender.subscribe(),
            last_seq: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Publish an event. Never blocks; dropped when nobody listens.
    pub fn emit(&self, kind: EventKind) {
        // Holding the counter across `send` keeps sequence numbers in channel order.
        let mut next = match self.inner.next_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let event = ProgressEvent {
            seq: *next,
            at: Utc::now(),
            kind,
        };
        *next += 1;
        let _ = self.inner.sender.send(event);
    }

    pub fn log(&self, level: LogLevel, source: Option<&SourceName>, message: impl Into<String>) {
        self.emit(EventKind::Log {
            level,
            source: source.cloned(),
            message: message.into(),
        });
    }

    pub fn item_init(&self, index: usize, item: &Item) {
        self.emit(EventKind::ItemInit {
            index,
            key: item.key.clone(),
            code: item.code.clone(),
            description: item.description.clone(),
        });
    }

    pub fn item_update(&self, index: usize, key: &str, source: &SourceName, result: SourceResult) {
        self.emit(EventKind::ItemUpdate {
            index,
            key: key.to_string(),
            source: source.clone(),
            result,
        });
    }

    pub fn terminal(&self, state: RunState, message: impl Into<String>) {
        self.emit(EventKind::Terminal {
            state,
            message: message.into(),
        });
    }
}

/// One observer's view of the channel.
#[derive(Debug)]
pub struct ProgressSubscription {
    receiver: broadcast::Receiver<ProgressEvent>,
    last_seq: u64,
}

impl ProgressSubscription {
    /// Next event, or a `Heartbeat` if nothing arrives within `timeout`.
    /// Returns `None` once the channel is closed and drained.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Err(_) => Some(self.synthesize(EventKind::Heartbeat)),
            Ok(Ok(event)) => {
                self.last_seq = event.seq;
                Some(event)
            }
            Ok(Err(RecvError::Lagged(missed))) => Some(self.synthesize(EventKind::Log {
                level: LogLevel::Warn,
                source: None,
                message: format!("observer fell behind; {missed} progress events were dropped"),
            })),
            Ok(Err(RecvError::Closed)) => None,
        }
    }

    /// Drain whatever is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    self.last_seq = event.seq;
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    fn synthesize(&self, kind: EventKind) -> ProgressEvent {
        ProgressEvent {
            seq: self.last_seq,
            at: Utc::now(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn events_arrive_in_order() {
        let channel = ProgressChannel::new(16);
        let mut sub = channel.subscribe();

        channel.log(LogLevel::Info, None, "first");
        channel.item_init(0, &Item::new("779", "C1", "Yerba"));
        channel.terminal(RunState::Completed, "done");

        let a = sub.next_event(WAIT).await.unwrap();
        let b = sub.next_event(WAIT).await.unwrap();
        let c = sub.next_event(WAIT).await.unwrap();
        assert!(a.seq < b.seq && b.seq < c.seq);
        assert!(matches!(b.kind, EventKind::ItemInit { index: 0, .. }));
        assert!(c.is_terminal());
    }

    #[tokio::test]
    async fn heartbeat_on_silence() {
        let channel = ProgressChannel::new(4);
        let mut sub = channel.subscribe();

        let event = sub.next_event(Duration::from_millis(20)).await.unwrap();
        assert_eq!(event.kind, EventKind::Heartbeat);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let channel = ProgressChannel::new(2);
        for i in 0..10 {
            channel.log(LogLevel::Info, None, format!("line {i}"));
        }
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_told_about_gaps() {
        let channel = ProgressChannel::new(2);
        let mut sub = channel.subscribe();

        for i in 0..5 {
            channel.log(LogLevel::Info, None, format!("line {i}"));
        }

        let warning = sub.next_event(WAIT).await.unwrap();
        match warning.kind {
            EventKind::Log { level, message, .. } => {
                assert_eq!(level, LogLevel::Warn);
                assert!(message.contains("3 progress events"), "{message}");
            }
            other => panic!("expected lag warning, got {other:?}"),
        }

        // The newest events are still delivered.
        let next = sub.next_event(WAIT).await.unwrap();
        assert_eq!(next.seq, 4);
    }

    #[tokio::test]
    async fn closed_channel_ends_subscription() {
        let channel = ProgressChannel::new(4);
        let mut sub = channel.subscribe();
        channel.terminal(RunState::Failed, "no sources selected");
        drop(channel);

        assert!(sub.next_event(WAIT).await.unwrap().is_terminal());
        assert!(sub.next_event(WAIT).await.is_none());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ProgressEvent {
            seq: 7,
            at: Utc::now(),
            kind: EventKind::ItemUpdate {
                index: 2,
                key: "779".into(),
                source: SourceName::new("vea"),
                result: SourceResult::not_found(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "item_update");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["result"]["status"], "not_found");
    }
}
