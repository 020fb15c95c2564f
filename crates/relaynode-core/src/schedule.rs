use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Owns the node's periodic background activities.
///
/// Each activity runs on its own interval and never assumes an ordering
/// relative to the others. A failing tick is logged and the schedule
/// carries on; only [`Scheduler::stop`] ends a schedule.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Scheduler {
    fn default() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until stopped.
    ///
    /// With `fire_immediately` the first tick runs at spawn time, otherwise
    /// one full period later.
    pub fn every<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        fire_immediately: bool,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown = self.shutdown_tx.subscribe();
        let start = if fire_immediately {
            Instant::now()
        } else {
            Instant::now() + period
        };

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            warn!(task = name, error = %e, "Periodic task tick failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        debug!(task = name, "Periodic task stopping");
                        break;
                    }
                }
            }
        });
        debug!(task = name, period_ms = period.as_millis() as u64, "Scheduled periodic task");
        self.tasks.push((name, handle));
    }

    /// Number of scheduled activities.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every schedule, waiting up to `grace` for in-flight ticks.
    ///
    /// Ticks still running after the grace period are aborted.
    pub async fn stop(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + grace;
        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => debug!(task = name, "Periodic task stopped"),
                Err(_) => {
                    warn!(task = name, "Periodic task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!("All periodic tasks stopped");
    }
}
