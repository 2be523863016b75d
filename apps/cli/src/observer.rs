//! Terminal progress observer and stdin pause/resume control.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use pricewatch_core::{Controller, EventKind, LogLevel, ProgressSubscription, RunOutcome};
use pricewatch_shared::LookupStatus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Renders progress events with an indicatif bar.
pub(crate) struct CliObserver {
    bar: ProgressBar,
}

impl CliObserver {
    pub(crate) fn new(total: usize, interactive: bool) -> Result<Self> {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {elapsed_precise} {msg}")?
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(80));
        if interactive {
            bar.println("Type p + Enter to pause, r + Enter to resume.");
        }
        Ok(Self { bar })
    }

    /// Print events until the run's terminal event.
    pub(crate) async fn follow(
        &self,
        subscription: &mut ProgressSubscription,
        heartbeat: Duration,
        is_paused: impl Fn() -> bool,
    ) {
        while let Some(event) = subscription.next_event(heartbeat).await {
            match event.kind {
                EventKind::Log {
                    level,
                    source,
                    message,
                } => {
                    let tag = match level {
                        LogLevel::Info => "info",
                        LogLevel::Warn => "warn",
                        LogLevel::Error => "error",
                    };
                    match source {
                        Some(source) => self.bar.println(format!("{tag:>5} [{source}] {message}")),
                        None => self.bar.println(format!("{tag:>5} {message}")),
                    }
                }
                EventKind::ItemInit { .. } => {}
                EventKind::ItemUpdate {
                    key,
                    source,
                    result,
                    ..
                } => {
                    self.bar.inc(1);
                    let line = match result.status {
                        LookupStatus::Found if result.secondary_value.is_empty() => {
                            format!("{key} [{source}] {}", result.primary_value)
                        }
                        LookupStatus::Found => format!(
                            "{key} [{source}] {} / {}",
                            result.primary_value, result.secondary_value
                        ),
                        status => format!("{key} [{source}] {status}"),
                    };
                    self.bar.println(line);
                }
                EventKind::Heartbeat => {
                    if is_paused() {
                        self.bar.set_message("paused");
                    } else {
                        self.bar.set_message("");
                    }
                }
                EventKind::Terminal { .. } => break,
            }
        }
        self.bar.finish_and_clear();
    }

    pub(crate) fn summary(&self, outcome: &RunOutcome) {
        println!();
        println!("  Run {}: {}", outcome.run_id, outcome.state);
        println!("  {}", outcome.message);
        println!();
        println!(
            "  {:<16} {:>6} {:>10} {:>6} {:>8}",
            "source", "found", "not found", "error", "pending"
        );
        for (source, stats) in &outcome.stats {
            println!(
                "  {:<16} {:>6} {:>10} {:>6} {:>8}",
                source.as_str(),
                stats.found,
                stats.not_found,
                stats.error,
                stats.pending
            );
        }
        println!();
        println!("  Time: {:.1}s", outcome.elapsed.as_secs_f64());
        println!();
    }
}

/// Read `p`/`r` lines from stdin and pause/resume the run.
///
/// Lines are read on a detached OS thread, so a pending read never holds up
/// runtime shutdown; the returned task applies the commands.
pub(crate) fn spawn_stdin_control(controller: Arc<Controller>) -> JoinHandle<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), tx));
    tokio::spawn(apply_commands(controller, rx))
}

/// Send each line of `reader` until it ends or nobody is listening.
fn forward_lines(reader: impl BufRead, tx: mpsc::UnboundedSender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        }
    }
}

async fn apply_commands(controller: Arc<Controller>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        match line.trim() {
            "p" | "pause" => controller.pause().await,
            "r" | "resume" => controller.resume().await,
            "" => {}
            other => warn!(input = other, "unknown command; use p or r"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use pricewatch_lookup::SourceRegistry;
    use pricewatch_shared::PipelinePolicy;
    use pricewatch_storage::Storage;

    async fn controller() -> Arc<Controller> {
        let path = std::env::temp_dir().join(format!("pw_cli_{}.db", uuid::Uuid::now_v7()));
        let store = Arc::new(Storage::open(&path).await.expect("open temp storage"));
        Arc::new(Controller::new(
            SourceRegistry::new(),
            store,
            PipelinePolicy::default(),
        ))
    }

    #[test]
    fn lines_are_forwarded_until_input_ends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(Cursor::new("p\nr\n"), tx);

        assert_eq!(rx.try_recv().unwrap(), "p");
        assert_eq!(rx.try_recv().unwrap(), "r");
        // The sender was dropped with the reader, so the channel is closed.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn forwarding_stops_when_the_receiver_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        // Returns instead of reading the rest of the input.
        forward_lines(Cursor::new("p\np\np\n"), tx);
    }

    #[tokio::test]
    async fn commands_pause_and_resume() {
        let ctl = controller().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(apply_commands(ctl.clone(), rx));

        tx.send(" p ".to_string()).unwrap();
        tx.send("bogus".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ctl.is_paused());

        tx.send("resume".to_string()).unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(!ctl.is_paused());
    }
}
