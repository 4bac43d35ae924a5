use std::sync::Arc;
use std::time::Duration;

use crewdesk_observability::{emit_event, BridgeEvent, ProcessKind};
use crewdesk_types::{Command, Mode};
use serde_json::Value;
use tokio::sync::watch;
use tracing::Level;

use crate::config::BridgeConfig;
use crate::connection::Connection;
use crate::error::{BridgeError, Result};
use crate::registry::Registry;

/// Sends typed commands and waits for the correlated response.
///
/// The dispatcher only reads the committed mode; transitions go through
/// [`crate::modes::ModeGuard`].
pub struct Dispatcher {
    connection: Arc<Connection>,
    registry: Arc<Registry>,
    mode: watch::Receiver<Mode>,
    config: Arc<BridgeConfig>,
}

impl Dispatcher {
    pub fn new(
        connection: Arc<Connection>,
        registry: Arc<Registry>,
        mode: watch::Receiver<Mode>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            connection,
            registry,
            mode,
            config,
        }
    }

    pub fn current_mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub async fn dispatch(&self, command: Command) -> Result<Value> {
        self.dispatch_with_timeout(command, None).await
    }

    pub async fn dispatch_with_timeout(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        command.validate()?;

        let mode = self.current_mode();
        let allowed = command.required_modes();
        if !allowed.contains(mode) {
            let command_type = command.command_type();
            tracing::info!(
                command_type = %command_type,
                mode = %mode,
                "command refused by mode guard"
            );
            emit_event(
                Level::INFO,
                ProcessKind::Shell,
                BridgeEvent {
                    command_type: Some(command_type.as_str()),
                    mode: Some(mode.as_str()),
                    status: Some("forbidden"),
                    ..BridgeEvent::new("dispatcher", "mode_forbidden")
                },
            );
            return Err(BridgeError::ModeForbidden {
                command_type,
                mode,
                allowed,
            });
        }

        self.send(command, timeout).await
    }

    async fn send(&self, command: Command, timeout: Option<Duration>) -> Result<Value> {
        let command_type = command.command_type();
        self.connection.ensure_connected().await?;

        let timeout = timeout.unwrap_or_else(|| self.config.timeout_for(command_type));
        let (correlation_id, mut rx) = self.registry.register(command_type, timeout);

        let frame = match command.to_wire(&correlation_id) {
            Ok(frame) => frame.to_string(),
            Err(err) => {
                self.registry.cancel(&correlation_id);
                return Err(err.into());
            }
        };
        if let Err(err) = self.connection.send(frame) {
            self.registry.cancel(&correlation_id);
            return Err(err);
        }
        tracing::debug!(
            correlation_id = %correlation_id,
            command_type = %command_type,
            "command sent"
        );

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed(
                "request dropped before a response arrived".to_string(),
            )),
            Err(_) => {
                if !self.registry.expire(&correlation_id) {
                    // Resolved between the timer firing and the removal.
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }
                let timeout_ms = timeout.as_millis() as u64;
                emit_event(
                    Level::WARN,
                    ProcessKind::Shell,
                    BridgeEvent {
                        correlation_id: Some(&correlation_id),
                        command_type: Some(command_type.as_str()),
                        status: Some("timeout"),
                        ..BridgeEvent::new("dispatcher", "request_timeout")
                    },
                );
                Err(BridgeError::Timeout {
                    command_type,
                    timeout_ms,
                })
            }
        }
    }
}
