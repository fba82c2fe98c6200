//! Device Reader: per-device read with bounded retries, classifying each
//! attempt's outcome via the Bus Adapter's typed `ReadOutcome` rather than
//! string matching (spec.md REDESIGN FLAGS; see `bus.rs`).

use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::bus::{BusAdapter, ReadOutcome};

const HOLDING_REGISTER_ADDRESS: u16 = 10;
const INTER_RETRY_DELAY: Duration = Duration::from_millis(200);
const CONNECTION_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Final outcome of a device read, consumed by the State Store.
pub enum DeviceReadResult {
    Value(u16),
    Error(String),
}

/// Reads one device's level register with up to `max_retries` attempts. Does
/// not validate the value — that is the Validator's job (spec.md §4.2).
pub async fn read_device(bus: &BusAdapter, slave: u8, max_retries: u32) -> DeviceReadResult {
    let attempts = max_retries.max(1);
    let mut last_error: Option<String> = None;

    for attempt in 0..attempts {
        let is_last = attempt + 1 == attempts;

        let outcome = bus.read_holding_register(slave, HOLDING_REGISTER_ADDRESS, 1).await;

        match outcome {
            ReadOutcome::Value(value) => return DeviceReadResult::Value(value),
            ReadOutcome::Protocol(msg) => {
                debug!(slave, attempt, error = %msg, "protocol error reading device");
                last_error = Some(msg);
            }
            ReadOutcome::Transport(msg) => {
                debug!(slave, attempt, error = %msg, "transport error reading device");
                last_error = Some(msg);
                if attempt == 0 {
                    // First-attempt connection failure gets one extra grace
                    // sleep before the remaining retries run, per spec.md
                    // §4.2 step 1.
                    sleep(CONNECTION_RETRY_DELAY).await;
                }
            }
        }

        if !is_last {
            sleep(INTER_RETRY_DELAY).await;
        }
    }

    DeviceReadResult::Error(last_error.unwrap_or_else(|| "connection not available".to_string()))
}
