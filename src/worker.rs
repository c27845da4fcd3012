use crate::connectivity::Connectivity;
use crate::model::ReplayOutcome;
use crate::queue::SyncQueue;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// What woke the worker up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timer,
    Reconnected,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Timer => "timer",
            Trigger::Reconnected => "reconnected",
            Trigger::Manual => "manual",
        }
    }
}

/// Run one pass and log the outcome. Local store errors are logged, not
/// propagated, so the worker keeps going.
pub async fn run_pass(queue: &SyncQueue, trigger: Trigger) -> Option<ReplayOutcome> {
    match queue.replay().await {
        Ok(outcome) => {
            if let ReplayOutcome::Completed(report) = outcome {
                if report.poisoned > 0 {
                    warn!(
                        trigger = trigger.as_str(),
                        poisoned = report.poisoned,
                        "some changes failed to sync; review required"
                    );
                }
            }
            Some(outcome)
        }
        Err(err) => {
            error!(?err, trigger = trigger.as_str(), "replay pass failed");
            None
        }
    }
}

/// Replay on every reconnect and on a fixed timer, forever.
pub async fn run(queue: &SyncQueue, mut connectivity: Connectivity, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut monitor_alive = true;

    info!(interval_ms = every.as_millis() as u64, "replay worker started");
    loop {
        let trigger = tokio::select! {
            _ = ticker.tick() => Trigger::Timer,
            changed = connectivity.changed(), if monitor_alive => match changed {
                Some(true) => Trigger::Reconnected,
                Some(false) => continue,
                None => {
                    warn!("connectivity monitor gone; falling back to timer only");
                    monitor_alive = false;
                    continue;
                }
            },
        };
        run_pass(queue, trigger).await;
    }
}
