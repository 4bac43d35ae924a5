#![allow(dead_code)]

//! In-process scripted backend shared by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crewdesk_bridge::{
    BridgeConfig, BridgeError, BridgeSession, Link, LinkControl, MemorySecretStore, Result,
    SecretStore, Transport,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// What the scripted backend answers to one command.
pub enum Reply {
    Success(Value),
    Error(String),
    /// Pushes these messages first, then answers with `data`.
    PushThenSuccess { pushes: Vec<Value>, data: Value },
    Silent,
}

pub type Responder = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

struct Shared {
    responder: Option<Responder>,
    mode: String,
    sent: Vec<Value>,
    opens: usize,
    fail_opens: usize,
    refuse_opens: bool,
    probe_ok: bool,
    holding: bool,
    held: Vec<String>,
    next_link: u64,
    current: Option<(u64, mpsc::UnboundedSender<String>)>,
}

#[derive(Clone)]
pub struct ScriptedBackend {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                responder: None,
                mode: "plan".to_string(),
                sent: Vec::new(),
                opens: 0,
                fail_opens: 0,
                refuse_opens: false,
                probe_ok: true,
                holding: false,
                held: Vec::new(),
                next_link: 0,
                current: None,
            })),
        }
    }

    /// Never answers anything.
    pub fn silent() -> Self {
        let backend = Self::new();
        backend.respond_with(|_, _| Reply::Silent);
        backend
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        self.shared.lock().responder = Some(Arc::new(responder));
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn sent(&self) -> Vec<Value> {
        self.shared.lock().sent.clone()
    }

    pub fn sent_types(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|frame| frame["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn sent_raw(&self) -> String {
        self.sent()
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn opens(&self) -> usize {
        self.shared.lock().opens
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.shared.lock().fail_opens = count;
    }

    pub fn refuse_opens(&self, refuse: bool) {
        self.shared.lock().refuse_opens = refuse;
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.shared.lock().probe_ok = ok;
    }

    /// Mode the backend reports for `get_mode`, e.g. after a restart.
    pub fn set_mode(&self, mode: &str) {
        self.shared.lock().mode = mode.to_string();
    }

    pub fn hold_replies(&self) {
        self.shared.lock().holding = true;
    }

    /// Sends every held reply, newest first.
    pub fn release_held_reversed(&self) -> usize {
        let (held, tx) = {
            let mut shared = self.shared.lock();
            shared.holding = false;
            let held = std::mem::take(&mut shared.held);
            (held, shared.current.as_ref().map(|(_, tx)| tx.clone()))
        };
        let Some(tx) = tx else { return 0 };
        let count = held.len();
        for frame in held.into_iter().rev() {
            let _ = tx.send(frame);
        }
        count
    }

    /// Sends an unsolicited message on the current link.
    pub fn push(&self, message: Value) -> bool {
        let shared = self.shared.lock();
        match &shared.current {
            Some((_, tx)) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    pub fn push_raw(&self, frame: &str) -> bool {
        let shared = self.shared.lock();
        match &shared.current {
            Some((_, tx)) => tx.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    /// Drops the current link as if the backend process died.
    pub fn kill_link(&self) {
        self.shared.lock().current = None;
    }

    fn handle_frame(&self, link_id: u64, frame: String) {
        let Ok(request) = serde_json::from_str::<Value>(&frame) else {
            return;
        };
        let command_type = request["type"].as_str().unwrap_or_default().to_string();
        let correlation_id = request["correlationId"].clone();
        let payload = request["payload"].clone();

        let responder = {
            let mut shared = self.shared.lock();
            shared.sent.push(request);
            shared.responder.clone()
        };
        let reply = match responder {
            Some(responder) => responder(&command_type, &payload),
            None => self.default_reply(&command_type, &payload),
        };

        let (pushes, response) = match reply {
            Reply::Silent => return,
            Reply::Success(data) => (
                Vec::new(),
                json!({"correlationId": correlation_id, "status": "success", "data": data}),
            ),
            Reply::Error(message) => (
                Vec::new(),
                json!({"correlationId": correlation_id, "status": "error", "error": message}),
            ),
            Reply::PushThenSuccess { pushes, data } => (
                pushes,
                json!({"correlationId": correlation_id, "status": "success", "data": data}),
            ),
        };

        let mut shared = self.shared.lock();
        let tx = match &shared.current {
            Some((id, tx)) if *id == link_id => tx.clone(),
            _ => return,
        };
        for message in pushes {
            let _ = tx.send(message.to_string());
        }
        if shared.holding {
            shared.held.push(response.to_string());
        } else {
            let _ = tx.send(response.to_string());
        }
    }

    fn default_reply(&self, command_type: &str, payload: &Value) -> Reply {
        match command_type {
            "get_mode" => Reply::Success(json!({"mode": self.shared.lock().mode.clone()})),
            "switch_mode" => {
                let mode = payload["mode"].as_str().unwrap_or("plan").to_string();
                self.shared.lock().mode = mode.clone();
                Reply::Success(json!({"mode": mode}))
            }
            "get_events" => Reply::Success(json!([])),
            "clear_logs" => Reply::Success(json!({"cleared": true})),
            "get_llm_configs" => Reply::Success(json!([])),
            _ => Reply::Success(json!({"ok": true})),
        }
    }
}

struct ScriptedControl {
    backend: ScriptedBackend,
    link_id: u64,
}

#[async_trait]
impl LinkControl for ScriptedControl {
    async fn probe(&self) -> Result<()> {
        let shared = self.backend.shared.lock();
        let current = matches!(&shared.current, Some((id, _)) if *id == self.link_id);
        if current && shared.probe_ok {
            Ok(())
        } else {
            Err(BridgeError::Transport("probe failed".to_string()))
        }
    }

    async fn shutdown(&self) {
        let mut shared = self.backend.shared.lock();
        if matches!(&shared.current, Some((id, _)) if *id == self.link_id) {
            shared.current = None;
        }
    }
}

#[async_trait]
impl Transport for ScriptedBackend {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn open(&self) -> Result<Link> {
        let link_id = {
            let mut shared = self.shared.lock();
            shared.opens += 1;
            if shared.refuse_opens {
                return Err(BridgeError::Transport("connection refused".to_string()));
            }
            if shared.fail_opens > 0 {
                shared.fail_opens -= 1;
                return Err(BridgeError::Transport("connection refused".to_string()));
            }
            shared.next_link += 1;
            shared.next_link
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
        self.shared.lock().current = Some((link_id, inbound_tx));

        let backend = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                backend.handle_frame(link_id, frame);
            }
        });

        Ok(Link {
            outbound: outbound_tx,
            inbound: inbound_rx,
            control: Arc::new(ScriptedControl {
                backend: self.clone(),
                link_id,
            }),
        })
    }
}

/// Small delays so reconnect scenarios finish quickly.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.request_timeout_ms = 2_000;
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.jitter_ratio = 0.0;
    config.reconnect.max_attempts = 3;
    config.health.degraded_grace_ms = 5_000;
    config
}

pub fn session_with(
    backend: &ScriptedBackend,
    config: BridgeConfig,
) -> (Arc<BridgeSession>, Arc<MemorySecretStore>) {
    let secrets = Arc::new(MemorySecretStore::new());
    let store: Arc<dyn SecretStore> = secrets.clone();
    let session = BridgeSession::new(config, backend.transport(), store).unwrap();
    (session, secrets)
}

pub async fn connected_session(
    backend: &ScriptedBackend,
) -> (Arc<BridgeSession>, Arc<MemorySecretStore>) {
    let (session, secrets) = session_with(backend, test_config());
    session.connect().await.unwrap();
    (session, secrets)
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn debug_event(timestamp: &str, kind: &str, source: &str) -> Value {
    json!({
        "timestamp": timestamp,
        "kind": kind,
        "source": source,
        "details": {},
        "status": "info",
    })
}

pub fn debug_push(timestamp: &str, kind: &str, source: &str) -> Value {
    json!({"kind": "debug_event", "event": debug_event(timestamp, kind, source)})
}
