//! Background task that decides when sync passes run.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::SyncService;
use crate::util::until_millis;

const MIN_WAKEUP: Duration = Duration::from_secs(1);

/// Handle to a running scheduler.
pub(super) struct SchedulerHandle {
    trigger: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a pass. Requests made while one is already queued collapse.
    pub(super) fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub(super) async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!("Sync scheduler exited abnormally: {error}");
        }
    }
}

/// Spawn the scheduler loop for `service`.
///
/// A pass runs on start when online, on every offline to online transition,
/// on explicit triggers, on the optional poll interval, and when the earliest
/// backed-off queue item becomes due. After a skipped pass the retry wakeup
/// is suspended; the next network change (such as a better link) runs a pass
/// instead.
pub(super) fn spawn(service: SyncService) -> SchedulerHandle {
    let (trigger, mut trigger_rx) = mpsc::channel(1);
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let mut network_rx = service.network().subscribe();
    let poll_interval = service.config().poll_interval();

    let task = tokio::spawn(async move {
        let mut was_online = network_rx.borrow_and_update().online;
        let mut ticker = poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let mut last_skipped = false;
        if was_online {
            last_skipped = run_pass(&service, "startup").await;
        }

        loop {
            let wakeup = if was_online && !last_skipped {
                next_wakeup(&service).await
            } else {
                None
            };

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = network_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = network_rx.borrow_and_update().online;
                    let reconnected = online && !was_online;
                    was_online = online;
                    if reconnected {
                        last_skipped = run_pass(&service, "reconnected").await;
                    } else if online && last_skipped {
                        last_skipped = run_pass(&service, "link changed").await;
                    }
                }
                Some(()) = trigger_rx.recv() => {
                    last_skipped = run_pass(&service, "mutation").await;
                }
                _ = tick(ticker.as_mut()) => {
                    if was_online {
                        last_skipped = run_pass(&service, "interval").await;
                    }
                }
                () = sleep_until(wakeup) => {
                    last_skipped = run_pass(&service, "retry").await;
                }
            }
        }
        tracing::debug!("Sync scheduler stopped");
    });

    SchedulerHandle {
        trigger,
        shutdown,
        task,
    }
}

/// Run one pass; `true` when it was skipped.
async fn run_pass(service: &SyncService, reason: &str) -> bool {
    tracing::debug!("Scheduled sync pass ({reason})");
    match service.sync_now().await {
        Ok(report) if report.ran() => {
            tracing::debug!("{report}");
            false
        }
        Ok(report) => report.skipped.is_some(),
        Err(error) => {
            tracing::error!("Scheduled sync pass failed: {error}");
            false
        }
    }
}

/// Delay until the earliest pending item becomes eligible.
async fn next_wakeup(service: &SyncService) -> Option<Duration> {
    match service.next_attempt_at().await {
        Ok(Some(at)) => Some(until_millis(at).max(MIN_WAKEUP)),
        Ok(None) => None,
        Err(error) => {
            tracing::warn!("Could not read the queue schedule: {error}");
            None
        }
    }
}

async fn tick(ticker: Option<&mut tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
