use std::sync::Arc;
use std::time::Duration;

use crewdesk_observability::{emit_event, BridgeEvent, ProcessKind};
use crewdesk_types::{
    AgentLlmView, Command, CommandError, CommandType, DebugEvent, EventQuery, LlmConfigUpdate,
    LlmStatus, Mode, ModeCapabilities, ModeRequest, ProviderCatalog,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::config::{BridgeConfig, EventDelivery};
use crate::connection::{Connection, ConnectionSnapshot, ConnectionState, ConnectionStatus};
use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::events::{EventConsumer, EventStats};
use crate::llm_config::LlmConfigCache;
use crate::modes::{ModeChange, ModeGuard, ModeInfo};
use crate::registry::{Registry, RegistryStats};
use crate::router::Router;
use crate::secrets::SecretStore;
use crate::transport::{self, Transport};

struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// `save_llm_config` payload as the UI sends it, key included.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveLlmConfigPayload {
    #[serde(alias = "agent_name")]
    agent_name: String,
    config: LlmConfigUpdate,
}

/// One bridge per backend connection. Owns every component and the
/// background tasks; this is the surface the UI talks to.
pub struct BridgeSession {
    config: Arc<BridgeConfig>,
    registry: Arc<Registry>,
    router: Arc<Router>,
    connection: Arc<Connection>,
    dispatcher: Arc<Dispatcher>,
    modes: Arc<ModeGuard>,
    events: Arc<EventConsumer>,
    llm: Arc<LlmConfigCache>,
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl BridgeSession {
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Arc::new(Registry::new());
        let router = Arc::new(Router::new(registry.clone()));
        let connection = Connection::new(
            transport,
            config.reconnect.clone(),
            config.health.degraded_grace(),
            router.clone(),
            registry.clone(),
        );
        let modes = Arc::new(ModeGuard::new());
        let dispatcher = Arc::new(Dispatcher::new(
            connection.clone(),
            registry.clone(),
            modes.subscribe(),
            config.clone(),
        ));
        let events = EventConsumer::new(config.events.capacity);
        if config.events.delivery == EventDelivery::Push {
            events.attach_push(&router);
        }
        let llm = Arc::new(LlmConfigCache::new(secrets));

        Ok(Arc::new(Self {
            config,
            registry,
            router,
            connection,
            dispatcher,
            modes,
            events,
            llm,
            tasks: Mutex::new(None),
        }))
    }

    /// Builds the transport named in `config`.
    pub fn from_config(config: BridgeConfig, secrets: Arc<dyn SecretStore>) -> Result<Arc<Self>> {
        let transport = transport::from_config(&config.transport);
        Self::new(config, transport, secrets)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Spawns the health monitor, the reconnect watcher and, for the poll
    /// strategy, the event poller. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            tracing::debug!("bridge session already started");
            return;
        }
        let cancel = CancellationToken::new();
        let mut handles = vec![
            self.spawn_health_monitor(cancel.clone()),
            self.spawn_reconnect_watcher(cancel.clone()),
        ];
        if self.config.events.delivery == EventDelivery::Poll {
            handles.push(self.spawn_event_poller(cancel.clone()));
        }
        *tasks = Some(BackgroundTasks { cancel, handles });
        drop(tasks);

        tracing::info!(
            transport = %self.connection.snapshot().transport,
            delivery = ?self.config.events.delivery,
            "bridge session started"
        );
        emit_event(
            Level::INFO,
            ProcessKind::Shell,
            BridgeEvent::new("session", "started"),
        );
    }

    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            tasks.cancel.cancel();
            for handle in tasks.handles {
                handle.abort();
            }
        }
        self.connection.disconnect().await;
        emit_event(
            Level::INFO,
            ProcessKind::Shell,
            BridgeEvent::new("session", "shutdown"),
        );
    }

    // ---- commands ----------------------------------------------------------

    /// Untyped entry point for the UI. Unknown types fail before anything is
    /// sent; commands with local state go through their owning component.
    pub async fn dispatch(&self, command_type: &str, payload: Value) -> Result<Value> {
        if command_type.trim() == CommandType::SaveLlmConfig.as_str() {
            let payload: SaveLlmConfigPayload =
                serde_json::from_value(payload).map_err(|e| CommandError::InvalidPayload {
                    command_type: CommandType::SaveLlmConfig,
                    reason: e.to_string(),
                })?;
            let view = self
                .save_llm_config(&payload.agent_name, payload.config)
                .await?;
            return Ok(serde_json::to_value(view)?);
        }
        let command = Command::from_parts(command_type, payload)?;
        self.execute(command).await
    }

    pub async fn execute(&self, command: Command) -> Result<Value> {
        self.route(command, None).await
    }

    /// Same routing as [`execute`](Self::execute) with a per-call timeout.
    pub async fn execute_with_timeout(&self, command: Command, timeout: Duration) -> Result<Value> {
        self.route(command, Some(timeout)).await
    }

    async fn route(&self, command: Command, timeout: Option<Duration>) -> Result<Value> {
        let dispatcher = self.dispatcher.as_ref();
        match command {
            Command::SwitchMode(ModeRequest { mode }) => {
                let change = self
                    .modes
                    .switch_mode_with_timeout(dispatcher, mode, timeout)
                    .await?;
                Ok(serde_json::to_value(change)?)
            }
            Command::GetMode => {
                self.modes
                    .refresh_mode_with_timeout(dispatcher, timeout)
                    .await?;
                Ok(serde_json::to_value(self.get_mode())?)
            }
            Command::ClearLogs => {
                let removed = self.events.clear_with_timeout(dispatcher, timeout).await?;
                Ok(json!({ "removed": removed }))
            }
            Command::GetLlmConfigs => {
                let views = self.llm.get_configs_with_timeout(dispatcher, timeout).await?;
                Ok(serde_json::to_value(views)?)
            }
            Command::SaveLlmConfig(request) => {
                let config = request.config;
                let update = LlmConfigUpdate {
                    provider_name: config.provider_name,
                    model_name: config.model_name,
                    temperature: config.temperature,
                    max_tokens: config.max_tokens,
                    api_key: None,
                };
                let view = self
                    .llm
                    .save_config_with_timeout(dispatcher, &request.agent_name, update, timeout)
                    .await?;
                Ok(serde_json::to_value(view)?)
            }
            other => dispatcher.dispatch_with_timeout(other, timeout).await,
        }
    }

    // ---- mode --------------------------------------------------------------

    pub fn get_mode(&self) -> ModeInfo {
        self.modes.info()
    }

    pub fn capabilities(&self) -> ModeCapabilities {
        self.modes.capabilities()
    }

    pub async fn switch_mode(&self, target: Mode) -> Result<ModeChange> {
        self.modes.switch_mode(&self.dispatcher, target).await
    }

    pub async fn refresh_mode(&self) -> Result<Mode> {
        self.modes.refresh_mode(&self.dispatcher).await
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<Mode> {
        self.modes.subscribe()
    }

    // ---- debug events ------------------------------------------------------

    pub fn get_debug_events(&self, query: &EventQuery) -> Vec<DebugEvent> {
        self.events.query(query)
    }

    pub fn subscribe_debug_events(&self) -> broadcast::Receiver<DebugEvent> {
        self.events.subscribe()
    }

    pub async fn clear_debug_logs(&self) -> Result<usize> {
        self.events.clear(&self.dispatcher).await
    }

    pub async fn poll_debug_events(&self) -> Result<usize> {
        self.events.poll_once(&self.dispatcher).await
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    // ---- LLM configuration -------------------------------------------------

    pub async fn get_llm_configs(&self) -> Result<Vec<AgentLlmView>> {
        self.llm.get_configs(&self.dispatcher).await
    }

    pub async fn get_llm_providers(&self) -> Result<ProviderCatalog> {
        self.llm.get_providers(&self.dispatcher).await
    }

    pub async fn get_llm_models(&self, provider: &str) -> Result<Vec<String>> {
        self.llm.get_models(&self.dispatcher, provider).await
    }

    pub async fn get_llm_status(&self) -> Result<LlmStatus> {
        self.llm.status(&self.dispatcher).await
    }

    pub async fn save_llm_config(
        &self,
        agent_name: &str,
        update: LlmConfigUpdate,
    ) -> Result<AgentLlmView> {
        self.llm
            .save_config(&self.dispatcher, agent_name, update)
            .await
    }

    pub fn cached_llm_config(&self, agent_name: &str) -> Option<crewdesk_types::AgentLlmConfig> {
        self.llm.cached(agent_name)
    }

    pub async fn delete_api_key(&self, provider: &str) -> Result<bool> {
        self.llm.delete_api_key(provider).await
    }

    pub async fn configured_providers(&self) -> Result<Vec<String>> {
        self.llm.configured_providers().await
    }

    // ---- connection --------------------------------------------------------

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub async fn health_check(&self) -> Result<()> {
        self.connection.health_check().await
    }

    pub fn connection_snapshot(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    // ---- background tasks --------------------------------------------------

    fn spawn_health_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let connection = self.connection.clone();
        let period = self.config.health.interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if connection.state() != ConnectionState::Connected {
                    continue;
                }
                if let Err(err) = connection.health_check().await {
                    tracing::warn!("health probe failed: {}", err);
                }
            }
        })
    }

    fn spawn_reconnect_watcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut status_rx = self.connection.subscribe();
        let modes = self.modes.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut last_generation = status_rx.borrow_and_update().generation;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let status = *status_rx.borrow_and_update();
                if status.state != ConnectionState::Connected
                    || status.generation <= last_generation
                {
                    continue;
                }
                let reconnected = last_generation > 0;
                last_generation = status.generation;
                if !reconnected {
                    continue;
                }
                // A restarted backend comes back in PLAN.
                match modes.refresh_mode(&dispatcher).await {
                    Ok(mode) => tracing::info!(mode = %mode, "mode refreshed after reconnect"),
                    Err(err) => tracing::warn!("mode refresh after reconnect failed: {}", err),
                }
            }
        })
    }

    fn spawn_event_poller(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.events.clone();
        let dispatcher = self.dispatcher.clone();
        let connection = self.connection.clone();
        let period = Duration::from_millis(self.config.events.poll_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if connection.state() != ConnectionState::Connected {
                    continue;
                }
                match events.poll_once(&dispatcher).await {
                    Ok(0) => {}
                    Ok(added) => tracing::debug!(added, "polled debug events"),
                    Err(BridgeError::Timeout { .. }) => {
                        tracing::debug!("debug event poll timed out")
                    }
                    Err(err) => tracing::warn!("debug event poll failed: {}", err),
                }
            }
        })
    }
}
