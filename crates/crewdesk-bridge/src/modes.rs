use std::time::Duration;

use crewdesk_observability::{emit_event, BridgeEvent, ProcessKind};
use crewdesk_types::{Command, Mode, ModeCapabilities};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::Level;

use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeInfo {
    pub mode: Mode,
    pub capabilities: ModeCapabilities,
    pub description: &'static str,
}

impl From<Mode> for ModeInfo {
    fn from(mode: Mode) -> Self {
        Self {
            mode,
            capabilities: mode.capabilities(),
            description: mode.description(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModeChange {
    pub previous: Mode,
    #[serde(flatten)]
    pub current: ModeInfo,
}

/// PLAN/ACT state machine. Single writer: every transition holds
/// `transition_lock` for its whole backend round trip, readers only ever see
/// committed values through the watch channel.
pub struct ModeGuard {
    tx: watch::Sender<Mode>,
    transition_lock: Mutex<()>,
}

impl Default for ModeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeGuard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Mode::Plan);
        Self {
            tx,
            transition_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Mode {
        *self.tx.borrow()
    }

    pub fn info(&self) -> ModeInfo {
        self.current().into()
    }

    pub fn capabilities(&self) -> ModeCapabilities {
        self.current().capabilities()
    }

    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.tx.subscribe()
    }

    pub async fn switch_mode(&self, dispatcher: &Dispatcher, target: Mode) -> Result<ModeChange> {
        self.switch_mode_with_timeout(dispatcher, target, None).await
    }

    pub async fn switch_mode_with_timeout(
        &self,
        dispatcher: &Dispatcher,
        target: Mode,
        timeout: Option<Duration>,
    ) -> Result<ModeChange> {
        let _transition = self.transition_lock.lock().await;
        let previous = self.current();
        if previous == target {
            return Err(BridgeError::InvalidTransition {
                from: previous,
                to: target,
            });
        }

        if let Err(err) = dispatcher
            .dispatch_with_timeout(Command::switch_mode(target), timeout)
            .await
        {
            tracing::warn!(from = %previous, to = %target, "mode switch failed: {}", err);
            emit_event(
                Level::WARN,
                ProcessKind::Shell,
                BridgeEvent {
                    mode: Some(previous.as_str()),
                    status: Some("failed"),
                    error_code: Some(err.kind()),
                    ..BridgeEvent::new("modes", "switch_failed")
                },
            );
            return Err(err);
        }

        self.tx.send_replace(target);
        tracing::info!(from = %previous, to = %target, "mode switched");
        emit_event(
            Level::INFO,
            ProcessKind::Shell,
            BridgeEvent {
                mode: Some(target.as_str()),
                status: Some("committed"),
                ..BridgeEvent::new("modes", "switched")
            },
        );
        Ok(ModeChange {
            previous,
            current: target.into(),
        })
    }

    /// Adopts whatever mode the backend reports, through the same writer path.
    pub async fn refresh_mode(&self, dispatcher: &Dispatcher) -> Result<Mode> {
        self.refresh_mode_with_timeout(dispatcher, None).await
    }

    pub async fn refresh_mode_with_timeout(
        &self,
        dispatcher: &Dispatcher,
        timeout: Option<Duration>,
    ) -> Result<Mode> {
        let _transition = self.transition_lock.lock().await;
        let data = dispatcher
            .dispatch_with_timeout(Command::GetMode, timeout)
            .await?;
        let reported = parse_reported_mode(&data)?;
        let changed = self.tx.send_if_modified(|mode| {
            if *mode == reported {
                return false;
            }
            *mode = reported;
            true
        });
        if changed {
            tracing::info!(mode = %reported, "adopted backend mode");
        }
        Ok(reported)
    }
}

/// Accepts `"act"`, `{"mode": "act"}` or `{"current_mode": "ACT"}`.
fn parse_reported_mode(data: &Value) -> Result<Mode> {
    let raw = match data {
        Value::String(s) => Some(s.as_str()),
        Value::Object(obj) => obj
            .get("mode")
            .or_else(|| obj.get("currentMode"))
            .or_else(|| obj.get("current_mode"))
            .and_then(Value::as_str),
        _ => None,
    };
    let raw = raw.ok_or_else(|| {
        BridgeError::Protocol(format!("get_mode reply carries no mode: {data}"))
    })?;
    raw.parse::<Mode>().map_err(BridgeError::Protocol)
}
