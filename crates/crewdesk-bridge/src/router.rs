use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crewdesk_types::{EnvelopeError, Inbound};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::BridgeError;
use crate::registry::Registry;

pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Splits inbound frames: correlated responses go to the registry,
/// unsolicited messages go to the handlers subscribed to their `kind`.
pub struct Router {
    registry: Arc<Registry>,
    subscribers: RwLock<HashMap<String, Vec<(SubscriberId, MessageHandler)>>>,
    next_subscriber: AtomicU64,
    unrouted: AtomicU64,
    malformed: AtomicU64,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            unrouted: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, kind: impl Into<String>, handler: F) -> SubscriberId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        for handlers in subscribers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != before;
        }
        subscribers.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    pub fn route(&self, frame: &str) {
        match Inbound::parse(frame) {
            Ok(Inbound::Response(envelope)) => {
                self.registry.resolve(envelope);
            }
            Ok(Inbound::Unsolicited { kind, message }) => {
                // Handlers run outside the lock so they may subscribe or
                // unsubscribe themselves.
                let handlers: Vec<MessageHandler> = self
                    .subscribers
                    .read()
                    .get(&kind)
                    .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    self.unrouted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(kind = %kind, "no subscriber for unsolicited message");
                    return;
                }
                for handler in handlers {
                    handler(&message);
                }
            }
            Err(EnvelopeError::InvalidResponse {
                correlation_id,
                reason,
            }) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                self.registry
                    .fail(&correlation_id, BridgeError::Protocol(reason));
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("discarding inbound frame: {}", e);
            }
        }
    }

    pub fn unrouted_total(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}
