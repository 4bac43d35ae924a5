//! Bridge between the crewdesk UI shell and its multi-agent backend.
//!
//! A [`BridgeSession`] owns one backend link. Commands are checked against
//! the committed PLAN/ACT mode before anything is sent, correlated with their
//! responses by id, and bounded by a timeout. Debug events, LLM settings and
//! provider keys are kept on this side of the link.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod llm_config;
pub mod modes;
pub mod registry;
pub mod router;
pub mod secrets;
pub mod session;
pub mod transport;

pub use config::{
    default_config_path, BridgeConfig, EventDelivery, EventsConfig, HealthPolicy,
    ReconnectPolicy, TransportConfig,
};
pub use connection::{
    backoff_delay, Connection, ConnectionSnapshot, ConnectionState, ConnectionStatus,
};
pub use dispatcher::Dispatcher;
pub use error::{BridgeError, Result};
pub use events::{EventBuffer, EventConsumer, EventStats};
pub use llm_config::LlmConfigCache;
pub use modes::{ModeChange, ModeGuard, ModeInfo};
pub use registry::{Registry, RegistryStats};
pub use router::{Router, SubscriberId};
pub use secrets::{EncryptedFileSecretStore, MemorySecretStore, SecretStore};
pub use session::BridgeSession;
pub use transport::{Link, LinkControl, Transport};
