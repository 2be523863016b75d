//! Cooperative pause/resume shared by every pipeline of a run.

use std::sync::Arc;

use tokio::sync::watch;

/// Binary Running/Paused signal backed by a watch channel.
///
/// Pipelines call [`PauseGate::wait_until_running`] before each item; a
/// lookup already in flight is never interrupted.
#[derive(Debug, Clone)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// A gate in the Running state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            paused: Arc::new(tx),
        }
    }

    /// Returns `true` if the gate was running before.
    pub fn pause(&self) -> bool {
        !self.paused.send_replace(true)
    }

    /// Returns `true` if the gate was paused before.
    pub fn resume(&self) -> bool {
        self.paused.send_replace(false)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is Running. Returns `true` if the caller actually
    /// had to wait.
    pub async fn wait_until_running(&self) -> bool {
        let mut rx = self.paused.subscribe();
        if !*rx.borrow_and_update() {
            return false;
        }
        // The sender lives as long as `self`, so this only ends on resume.
        let _ = rx.wait_for(|paused| !*paused).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn starts_running() {
        let gate = PauseGate::new();
        assert!(!gate.is_paused());
        assert!(!gate.wait_until_running().await);
    }

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let gate = PauseGate::new();
        assert!(gate.pause());
        assert!(!gate.pause(), "second pause is a no-op");

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_running().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        assert!(gate.resume());
        let waited = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
        assert!(waited);
    }

    #[tokio::test]
    async fn every_clone_sees_the_same_state() {
        let gate = PauseGate::new();
        let other = gate.clone();
        gate.pause();
        assert!(other.is_paused());
        other.resume();
        assert!(!gate.is_paused());
    }
}
