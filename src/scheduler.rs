//! Poll Scheduler: drives the polling cycle, structured like
//! `comsrv/service_impl`'s cleanup task pattern — a `tokio::select!` between
//! a fixed-delay sleep and a cancellation signal, looping over a device
//! list each cycle (spec.md §4.5).

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::alerts::AlertEngine;
use crate::bus::BusAdapter;
use crate::config::{Config, PollingConfig};
use crate::persistence::{PersistenceQueue, PersistenceRecord};
use crate::reader::{read_device, DeviceReadResult};
use crate::state::{StateStore, UpdateOutcome};

pub struct PollScheduler {
    bus: Arc<BusAdapter>,
    state: Arc<StateStore>,
    persistence: PersistenceQueue,
    alerts: Arc<AlertEngine>,
    polling: PollingConfig,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        bus: Arc<BusAdapter>,
        state: Arc<StateStore>,
        persistence: PersistenceQueue,
        alerts: Arc<AlertEngine>,
        polling: PollingConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            bus,
            state,
            persistence,
            alerts,
            polling,
            shutdown,
        }
    }

    /// Runs cycles until the shutdown token is cancelled. A cycle may be
    /// aborted between any two devices (checked at the top of each
    /// iteration) so shutdown latency is bounded by one device read.
    pub async fn run(self) {
        let interval = Duration::from_secs_f64(self.polling.interval_seconds);
        let slave_delay = Duration::from_secs_f64(self.polling.slave_delay_seconds);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let cycle_start = Instant::now();
            self.state.begin_cycle();

            for &slave in &self.polling.slaves {
                if self.shutdown.is_cancelled() {
                    break;
                }

                let result = read_device(&self.bus, slave, self.polling.max_retries).await;
                let outcome = match result {
                    DeviceReadResult::Value(value) => self.state.update(slave, Some(value), None),
                    DeviceReadResult::Error(err) => self.state.update(slave, None, Some(err)),
                };

                if let UpdateOutcome::Accepted { value, at, .. } = outcome {
                    self.persistence.enqueue(PersistenceRecord {
                        external_code: Config::external_code(slave),
                        value,
                        timestamp: at,
                    });
                }

                if !slave_delay.is_zero() {
                    tokio::time::sleep(slave_delay).await;
                }
            }

            let snapshot = self.state.snapshot();
            self.alerts.evaluate(&snapshot).await;

            let elapsed = cycle_start.elapsed();
            let sleep_time = interval.saturating_sub(elapsed).max(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(sleep_time) => {}
                _ = self.shutdown.cancelled() => {
                    info!("poll scheduler received shutdown signal");
                    break;
                }
            }
        }

        info!("poll scheduler stopped");
    }
}

/// Runs the scheduler, catching a panic at the top of the loop and emitting
/// a critical alert before the process exits, per spec.md §7's "scheduler
/// crash" handling.
pub async fn run_supervised(scheduler: PollScheduler, alerts: Arc<AlertEngine>) {
    let result = std::panic::AssertUnwindSafe(scheduler.run())
        .catch_unwind()
        .await;
    if let Err(payload) = result {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(panic = %message, "poll scheduler crashed");
        alerts.notify_critical(&format!("scheduler crashed: {message}")).await;
    }
}
