//! Pluggable links to the agent backend.
//!
//! A [`Transport`] knows how to open a [`Link`]: an outbound frame sender, an
//! inbound frame receiver and a [`LinkControl`] handle. One frame carries one
//! JSON message. The inbound receiver yields `None` once the link is gone.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TransportConfig;
use crate::error::Result;

pub mod stdio;
pub mod websocket;

pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Cheap liveness check that does not go through the command channel.
    async fn probe(&self) -> Result<()>;

    async fn shutdown(&self);
}

pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
    pub control: Arc<dyn LinkControl>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short human-readable target, used in logs and snapshots.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<Link>;
}

pub fn from_config(config: &TransportConfig) -> Arc<dyn Transport> {
    match config {
        TransportConfig::Stdio {
            program,
            args,
            env,
            cwd,
        } => Arc::new(
            StdioTransport::new(program.clone())
                .args(args.iter().cloned())
                .envs(env.clone())
                .current_dir(cwd.clone()),
        ),
        TransportConfig::WebSocket { url } => Arc::new(WebSocketTransport::new(url.clone())),
    }
}
