use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crewdesk_types::CommandType;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use crate::error::{BridgeError, Result};

pub const DEFAULT_BACKEND_URL: &str = "ws://localhost:3000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub request_timeout_ms: u64,
    /// Per-command overrides of `request_timeout_ms`.
    pub command_timeouts_ms: BTreeMap<CommandType, u64>,
    pub reconnect: ReconnectPolicy,
    pub health: HealthPolicy,
    pub events: EventsConfig,
    pub transport: TransportConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            command_timeouts_ms: BTreeMap::new(),
            reconnect: ReconnectPolicy::default(),
            health: HealthPolicy::default(),
            events: EventsConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the delay.
    pub jitter_ratio: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthPolicy {
    pub interval_ms: u64,
    pub degraded_grace_ms: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            degraded_grace_ms: 10_000,
        }
    }
}

impl HealthPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn degraded_grace(&self) -> Duration {
        Duration::from_millis(self.degraded_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventDelivery {
    #[default]
    Push,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
    pub delivery: EventDelivery,
    pub poll_interval_ms: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            delivery: EventDelivery::Push,
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn the backend and talk newline-delimited JSON over its stdio.
    Stdio {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Attach to a backend that is already serving a WebSocket endpoint.
    #[serde(alias = "websocket")]
    WebSocket { url: String },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::WebSocket {
            url: DEFAULT_BACKEND_URL.to_string(),
        }
    }
}

impl BridgeConfig {
    /// Reads `path` (missing file means defaults), then applies `CREWDESK_*`
    /// environment overrides and validates the result.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok()).await
    }

    pub async fn load_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut root = read_json_file(path.as_ref()).await?;
        deep_merge(&mut root, &env_layer(lookup));
        let config: BridgeConfig = serde_json::from_value(root)
            .map_err(|err| BridgeError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms must be positive"));
        }
        if let Some((ty, _)) = self.command_timeouts_ms.iter().find(|(_, ms)| **ms == 0) {
            return Err(invalid(format!("timeout for {ty} must be positive")));
        }
        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms must be positive"));
        }
        if !reconnect.factor.is_finite() || reconnect.factor < 1.0 {
            return Err(invalid("reconnect.factor must be at least 1"));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(invalid(
                "reconnect.max_delay_ms must not be below reconnect.base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(invalid("reconnect.jitter_ratio must be within [0, 1]"));
        }
        if reconnect.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts must be positive"));
        }
        if self.health.interval_ms == 0 {
            return Err(invalid("health.interval_ms must be positive"));
        }
        if self.events.capacity == 0 {
            return Err(invalid("events.capacity must be positive"));
        }
        if self.events.delivery == EventDelivery::Poll && self.events.poll_interval_ms == 0 {
            return Err(invalid("events.poll_interval_ms must be positive"));
        }
        match &self.transport {
            TransportConfig::Stdio { program, .. } if program.trim().is_empty() => {
                return Err(invalid("transport.program cannot be empty"));
            }
            TransportConfig::WebSocket { url }
                if !(url.starts_with("ws://") || url.starts_with("wss://")) =>
            {
                return Err(invalid(format!("transport.url is not a ws:// URL: {url}")));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn timeout_for(&self, command_type: CommandType) -> Duration {
        let ms = self
            .command_timeouts_ms
            .get(&command_type)
            .copied()
            .unwrap_or(self.request_timeout_ms);
        Duration::from_millis(ms)
    }
}

/// `<config dir>/crewdesk/bridge.json`, or `CREWDESK_CONFIG` when set.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CREWDESK_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("crewdesk").join("bridge.json"))
        .unwrap_or_else(|| PathBuf::from(".crewdesk/bridge.json"))
}

fn invalid(message: impl Into<String>) -> BridgeError {
    BridgeError::InvalidConfig(message.into())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    if raw.trim().is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_str::<Value>(&raw)
        .map_err(|err| invalid(format!("{}: {err}", path.display())))
}

fn env_layer<F>(lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut root = empty_object();
    let numeric = |key: &str| lookup(key).and_then(|raw| raw.trim().parse::<u64>().ok());

    if let Some(ms) = numeric("CREWDESK_REQUEST_TIMEOUT_MS") {
        deep_merge(&mut root, &json!({ "request_timeout_ms": ms }));
    }
    if let Some(ms) = numeric("CREWDESK_RECONNECT_BASE_MS") {
        deep_merge(&mut root, &json!({ "reconnect": { "base_delay_ms": ms } }));
    }
    if let Some(ms) = numeric("CREWDESK_RECONNECT_MAX_MS") {
        deep_merge(&mut root, &json!({ "reconnect": { "max_delay_ms": ms } }));
    }
    if let Some(attempts) = numeric("CREWDESK_RECONNECT_MAX_ATTEMPTS") {
        deep_merge(&mut root, &json!({ "reconnect": { "max_attempts": attempts } }));
    }
    if let Some(ms) = numeric("CREWDESK_HEALTH_INTERVAL_MS") {
        deep_merge(&mut root, &json!({ "health": { "interval_ms": ms } }));
    }
    if let Some(ms) = numeric("CREWDESK_DEGRADED_GRACE_MS") {
        deep_merge(&mut root, &json!({ "health": { "degraded_grace_ms": ms } }));
    }
    if let Some(capacity) = numeric("CREWDESK_EVENT_CAPACITY") {
        deep_merge(&mut root, &json!({ "events": { "capacity": capacity } }));
    }
    if let Some(delivery) = lookup("CREWDESK_EVENT_DELIVERY") {
        let delivery = delivery.trim().to_ascii_lowercase();
        if delivery == "push" || delivery == "poll" {
            deep_merge(&mut root, &json!({ "events": { "delivery": delivery } }));
        }
    }
    if let Some(ms) = numeric("CREWDESK_POLL_INTERVAL_MS") {
        deep_merge(&mut root, &json!({ "events": { "poll_interval_ms": ms } }));
    }

    // A backend command wins over a URL when both are set.
    if let Some(url) = lookup("CREWDESK_BACKEND_URL").filter(|v| !v.trim().is_empty()) {
        if let Some(obj) = root.as_object_mut() {
            obj.insert(
                "transport".to_string(),
                json!({ "kind": "web_socket", "url": url.trim() }),
            );
        }
    }
    if let Some(command) = lookup("CREWDESK_BACKEND_COMMAND") {
        let mut parts = command.split_whitespace().map(str::to_string);
        if let Some(program) = parts.next() {
            let args: Vec<String> = parts.collect();
            if let Some(obj) = root.as_object_mut() {
                obj.insert(
                    "transport".to_string(),
                    json!({ "kind": "stdio", "program": program, "args": args }),
                );
            }
        }
    }

    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                // Transport is a tagged union; merging two variants field by
                // field would mix them.
                if key == "transport" {
                    base_map.insert(key.clone(), value.clone());
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
