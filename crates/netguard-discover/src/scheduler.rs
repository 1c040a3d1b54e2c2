//! Periodic scan driver.
//!
//! Lives outside the engine: it owns the interval and shutdown, and calls
//! [`ScanEngine::scan_and_commit`] on every tick. A tick that finds the
//! engine busy is skipped; any other failure is logged and the loop goes on.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::engine::ScanEngine;
use crate::error::DiscoverError;

pub struct ScanScheduler {
    engine: Arc<ScanEngine>,
    interval: Duration,
}

impl ScanScheduler {
    pub fn new(engine: Arc<ScanEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Scan every interval until `shutdown` turns true or its sender is dropped.
    ///
    /// Shutdown is observed between cycles; a running cycle finishes first.
    /// Returns the number of committed cycles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut committed = 0;

        tracing::info!(interval_secs = self.interval.as_secs(), "Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            tracing::info!("Scheduled scan triggered");
            match self.engine.scan_and_commit(None).await {
                Ok(outcome) => {
                    committed += 1;
                    tracing::info!(
                        scan_id = %outcome.scan_id,
                        devices = outcome.summary.total_devices,
                        "Scheduled scan complete"
                    );
                }
                Err(DiscoverError::EngineBusy) => {
                    tracing::info!("Engine busy, skipping scheduled scan");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Scheduled scan failed");
                }
            }
        }

        tracing::info!(cycles = committed, "Scheduler stopped");
        committed
    }
}
