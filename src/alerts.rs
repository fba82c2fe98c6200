//! Alert Engine: per-device offline debounce and cooldown, dispatching
//! change-of-state notifications to a chat transport. Grounded in
//! `rulesrv/src/action_executor.rs`'s `ActionExecutor` (a `reqwest::Client`
//! built once with a timeout, held alongside the mutable state it acts on)
//! and the elapsed-duration debounce idiom of
//! `alarmsrv/src/domain/alarm.rs::needs_escalation`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tracing::{error, info, warn};

use crate::config::AlertsConfig;
use crate::state::DeviceStatus;

struct AlertState {
    currently_offline: HashSet<u8>,
    last_alert: HashMap<u8, Instant>,
}

pub struct AlertEngine {
    enabled: bool,
    offline_threshold: Duration,
    cooldown: Duration,
    bot_token: Option<String>,
    chat_id: Option<String>,
    http: Client,
    state: Mutex<AlertState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NotificationKind {
    Offline,
    Recovery,
}

impl AlertEngine {
    pub fn new(config: &AlertsConfig) -> Self {
        let (bot_token, chat_id) = if config.enabled {
            (
                std::env::var(&config.telegram.bot_token_env).ok(),
                std::env::var(&config.telegram.chat_id_env).ok(),
            )
        } else {
            (None, None)
        };

        if config.enabled && (bot_token.is_none() || chat_id.is_none()) {
            warn!("alerts enabled but telegram env vars are not set; notifications will be dropped");
        }

        Self {
            enabled: config.enabled,
            offline_threshold: Duration::from_secs(config.offline_threshold_minutes * 60),
            cooldown: Duration::from_secs(config.telegram.alert_cooldown_minutes * 60),
            bot_token,
            chat_id,
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
            state: Mutex::new(AlertState {
                currently_offline: HashSet::new(),
                last_alert: HashMap::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Evaluates debounce/cooldown transitions for every device in
    /// `snapshot` and dispatches any notifications that result.
    pub async fn evaluate(&self, snapshot: &HashMap<u8, DeviceStatus>) {
        if !self.enabled {
            return;
        }

        let mut to_send: Vec<(u8, NotificationKind)> = Vec::new();
        {
            let mut state = self.state.lock().expect("alert state mutex poisoned");
            let now = Instant::now();
            let wall_now = Utc::now();

            for status in snapshot.values() {
                let offline_too_long = !status.online
                    && status
                        .last_ok
                        .map(|last| wall_now.signed_duration_since(last).to_std().unwrap_or(Duration::ZERO) > self.offline_threshold)
                        .unwrap_or(true);

                if offline_too_long && !state.currently_offline.contains(&status.slave) {
                    state.currently_offline.insert(status.slave);
                    let suppressed = state
                        .last_alert
                        .get(&status.slave)
                        .map(|last| now.duration_since(*last) < self.cooldown)
                        .unwrap_or(false);
                    if !suppressed {
                        state.last_alert.insert(status.slave, now);
                        to_send.push((status.slave, NotificationKind::Offline));
                    }
                } else if status.online && state.currently_offline.contains(&status.slave) {
                    state.currently_offline.remove(&status.slave);
                    state.last_alert.remove(&status.slave);
                    to_send.push((status.slave, NotificationKind::Recovery));
                }
            }
        }

        for (slave, kind) in to_send {
            self.dispatch(slave, kind).await;
        }
    }

    pub async fn notify_startup(&self) {
        if !self.enabled {
            return;
        }
        self.send(&"Silo field monitor started.".to_string()).await;
    }

    pub async fn notify_critical(&self, message: &str) {
        if !self.enabled {
            return;
        }
        self.send(&format!("CRITICAL: {message}")).await;
    }

    pub async fn test_notification(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.send(&"Test notification from silo field monitor.".to_string()).await
    }

    async fn dispatch(&self, slave: u8, kind: NotificationKind) {
        let text = match kind {
            NotificationKind::Offline => format!("Device S{slave:02} is OFFLINE."),
            NotificationKind::Recovery => format!("Device S{slave:02} has RECOVERED."),
        };
        self.send(&text).await;
    }

    /// Sends a message via the chat transport. On transport failure the
    /// notification is dropped with no retry — state-machine side effects
    /// that already happened are preserved (spec.md §4.7).
    async fn send(&self, text: &str) -> bool {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            warn!("alert transport not configured, dropping notification");
            return false;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let result = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(message = %text, "alert dispatched");
                true
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "alert transport returned error status");
                false
            }
            Err(e) => {
                warn!(error = %e, "alert transport failed, dropping notification");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelegramConfig;
    use chrono::Duration as ChronoDuration;

    fn engine() -> AlertEngine {
        AlertEngine::new(&AlertsConfig {
            enabled: true,
            offline_threshold_minutes: 1,
            telegram: TelegramConfig {
                bot_token_env: "SILOD_TEST_BOT_TOKEN_UNSET".to_string(),
                chat_id_env: "SILOD_TEST_CHAT_ID_UNSET".to_string(),
                alert_cooldown_minutes: 15,
            },
        })
    }

    fn device(slave: u8, online: bool, last_ok_secs_ago: Option<i64>) -> DeviceStatus {
        DeviceStatus {
            slave,
            value: if online { Some(100) } else { None },
            percent: if online { Some(1) } else { None },
            online,
            last_ok: last_ok_secs_ago.map(|s| Utc::now() - ChronoDuration::seconds(s)),
            last_error: None,
            error_count: 0,
            total_reads: 1,
        }
    }

    #[tokio::test]
    async fn offline_beyond_threshold_marks_currently_offline() {
        let engine = engine();
        let mut snap = HashMap::new();
        snap.insert(3, device(3, false, Some(90)));
        engine.evaluate(&snap).await;
        let state = engine.state.lock().unwrap();
        assert!(state.currently_offline.contains(&3));
    }

    #[tokio::test]
    async fn recovery_clears_offline_set_and_last_alert() {
        let engine = engine();
        let mut snap = HashMap::new();
        snap.insert(3, device(3, false, Some(90)));
        engine.evaluate(&snap).await;

        snap.insert(3, device(3, true, Some(0)));
        engine.evaluate(&snap).await;

        let state = engine.state.lock().unwrap();
        assert!(!state.currently_offline.contains(&3));
        assert!(!state.last_alert.contains_key(&3));
    }

    #[tokio::test]
    async fn not_yet_offline_long_enough_is_not_alarmed() {
        let engine = engine();
        let mut snap = HashMap::new();
        snap.insert(3, device(3, false, Some(30)));
        engine.evaluate(&snap).await;
        let state = engine.state.lock().unwrap();
        assert!(!state.currently_offline.contains(&3));
    }
}
