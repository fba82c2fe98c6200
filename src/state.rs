//! State Store: the single shared map of device status + bounded history
//! rings, guarded by one mutex (spec.md §4.4). `std::sync::Mutex` is used,
//! not `tokio::sync::Mutex`, because every critical section here is
//! synchronous and short — matching the teacher's preference for plain
//! mutexes over async ones when the critical section never awaits (see
//! `alarmsrv`'s in-memory alarm index).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ValidationConfig;
use crate::validator::validate;

#[derive(Debug, Clone, Serialize)]
pub struct HistorySample {
    pub timestamp: DateTime<Utc>,
    pub value: u16,
    pub percent: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub slave: u8,
    pub value: Option<u16>,
    pub percent: Option<u8>,
    pub online: bool,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub total_reads: u64,
}

impl DeviceStatus {
    fn new(slave: u8) -> Self {
        Self {
            slave,
            value: None,
            percent: None,
            online: false,
            last_ok: None,
            last_error: None,
            error_count: 0,
            total_reads: 0,
        }
    }

    /// `(total_reads - error_count) / total_reads`, or 0 when no reads yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            return 0.0;
        }
        (self.total_reads - self.error_count) as f64 / self.total_reads as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalStats {
    pub total_polls: u64,
    pub successful_polls: u64,
    pub start_time: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
    pub online_slaves: usize,
    pub total_slaves: usize,
    pub uptime_seconds: i64,
}

struct StateInner {
    devices: HashMap<u8, DeviceStatus>,
    history: HashMap<u8, VecDeque<HistorySample>>,
    total_polls: u64,
    successful_polls: u64,
    start_time: DateTime<Utc>,
    last_poll: Option<DateTime<Utc>>,
}

/// The result of feeding one device read into the state store, used by the
/// Poll Scheduler to decide whether to enqueue a persistence record.
pub enum UpdateOutcome {
    Accepted { value: u16, percent: u8, at: DateTime<Utc> },
    Rejected,
}

pub struct StateStore {
    inner: Mutex<StateInner>,
    history_max_points: usize,
    range: ValidationConfig,
}

impl StateStore {
    pub fn new(slaves: &[u8], history_max_points: usize, range: ValidationConfig) -> Self {
        let mut devices = HashMap::new();
        let mut history = HashMap::new();
        for &slave in slaves {
            devices.insert(slave, DeviceStatus::new(slave));
            history.insert(slave, VecDeque::with_capacity(history_max_points));
        }
        Self {
            inner: Mutex::new(StateInner {
                devices,
                history,
                total_polls: 0,
                successful_polls: 0,
                start_time: Utc::now(),
                last_poll: None,
            }),
            history_max_points,
            range,
        }
    }

    pub fn begin_cycle(&self) {
        let mut inner = self.inner.lock().expect("state store mutex poisoned");
        inner.total_polls += 1;
        inner.last_poll = Some(Utc::now());
    }

    /// Applies one device read. Holds the mutex for the whole update so a
    /// concurrent `snapshot()` never observes a torn record (I5).
    pub fn update(&self, slave: u8, value: Option<u16>, error: Option<String>) -> UpdateOutcome {
        let mut inner = self.inner.lock().expect("state store mutex poisoned");

        let validated = match (value, error) {
            (_, Some(err)) => Err(err),
            (Some(raw), None) => validate(raw, &self.range).map_err(|e| e.to_string()),
            (None, None) => Err("no value and no error reported".to_string()),
        };

        let device = inner
            .devices
            .entry(slave)
            .or_insert_with(|| DeviceStatus::new(slave));
        device.total_reads += 1;

        match validated {
            Ok(percent) => {
                let raw = value.expect("validated implies a value");
                let now = Utc::now();
                device.value = Some(raw);
                device.percent = Some(percent);
                device.online = true;
                device.last_ok = Some(now);
                device.last_error = None;

                let history_max = self.history_max_points;
                let ring = inner.history.entry(slave).or_default();
                ring.push_back(HistorySample {
                    timestamp: now,
                    value: raw,
                    percent,
                });
                while ring.len() > history_max {
                    ring.pop_front();
                }

                inner.successful_polls += 1;
                UpdateOutcome::Accepted {
                    value: raw,
                    percent,
                    at: now,
                }
            }
            Err(msg) => {
                device.online = false;
                device.last_error = Some(msg);
                device.error_count += 1;
                UpdateOutcome::Rejected
            }
        }
    }

    /// Deep copy of every device's status, suitable for serialization.
    pub fn snapshot(&self) -> HashMap<u8, DeviceStatus> {
        let inner = self.inner.lock().expect("state store mutex poisoned");
        inner.devices.clone()
    }

    /// Copy of one device's history ring, optionally truncated to the most
    /// recent `points` samples.
    pub fn history(&self, slave: u8, points: Option<usize>) -> Option<Vec<HistorySample>> {
        let inner = self.inner.lock().expect("state store mutex poisoned");
        let ring = inner.history.get(&slave)?;
        let samples: Vec<HistorySample> = ring.iter().cloned().collect();
        Some(match points {
            Some(n) if n < samples.len() => samples[samples.len() - n..].to_vec(),
            _ => samples,
        })
    }

    pub fn stats(&self) -> GlobalStats {
        let inner = self.inner.lock().expect("state store mutex poisoned");
        let online_slaves = inner.devices.values().filter(|d| d.online).count();
        GlobalStats {
            total_polls: inner.total_polls,
            successful_polls: inner.successful_polls,
            start_time: inner.start_time,
            last_poll: inner.last_poll,
            online_slaves,
            total_slaves: inner.devices.len(),
            uptime_seconds: (Utc::now() - inner.start_time).num_seconds().max(0),
        }
    }

    pub fn contains(&self, slave: u8) -> bool {
        let inner = self.inner.lock().expect("state store mutex poisoned");
        inner.devices.contains_key(&slave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::new(
            &[1, 2],
            3,
            ValidationConfig {
                min_value: 0,
                max_value: 28000,
            },
        )
    }

    #[test]
    fn accepted_reading_sets_online_and_history() {
        let store = store();
        let outcome = store.update(1, Some(14000), None);
        assert!(matches!(outcome, UpdateOutcome::Accepted { percent: 50, .. }));

        let snap = store.snapshot();
        let status = &snap[&1];
        assert!(status.online);
        assert_eq!(status.value, Some(14000));
        assert_eq!(status.percent, Some(50));
        assert_eq!(status.error_count, 0);
        assert_eq!(status.total_reads, 1);

        let history = store.history(1, None).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn out_of_range_marks_offline_without_history() {
        let store = store();
        let outcome = store.update(1, Some(30000), None);
        assert!(matches!(outcome, UpdateOutcome::Rejected));

        let snap = store.snapshot();
        let status = &snap[&1];
        assert!(!status.online);
        assert!(status.last_error.as_ref().unwrap().contains("out of range"));
        assert_eq!(status.error_count, 1);
        assert_eq!(status.total_reads, 1);
        assert!(store.history(1, None).unwrap().is_empty());
    }

    #[test]
    fn transport_error_counts_as_error() {
        let store = store();
        store.update(1, None, Some("timeout".to_string()));
        let snap = store.snapshot();
        assert_eq!(snap[&1].error_count, 1);
        assert!(!snap[&1].online);
    }

    #[test]
    fn history_ring_is_bounded() {
        let store = store();
        for v in [100u16, 200, 300, 400] {
            store.update(1, Some(v), None);
        }
        let history = store.history(1, None).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.first().unwrap().value, 200);
        assert_eq!(history.last().unwrap().value, 400);
    }

    #[test]
    fn error_count_never_exceeds_total_reads() {
        let store = store();
        store.update(1, Some(100), None);
        store.update(1, Some(99999), None);
        store.update(1, None, Some("timeout".to_string()));
        let snap = store.snapshot();
        assert!(snap[&1].error_count <= snap[&1].total_reads);
    }
}
