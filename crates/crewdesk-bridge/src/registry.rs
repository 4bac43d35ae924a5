use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crewdesk_types::{CommandType, ResponseEnvelope, ResponseStatus};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{BridgeError, Result};

pub type Resolver = oneshot::Sender<Result<Value>>;

pub struct PendingRequest {
    pub correlation_id: String,
    pub command_type: CommandType,
    pub issued_at: Instant,
    pub timeout: Duration,
    resolver: Resolver,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub live: usize,
    pub issued: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub dropped_unknown: u64,
}

/// Outstanding requests keyed by correlation id.
///
/// Ids are `<session prefix>-<counter>`: the prefix is random per registry and
/// the counter only grows, so an id is never handed out twice.
pub struct Registry {
    prefix: String,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
    issued: AtomicU64,
    resolved: AtomicU64,
    timed_out: AtomicU64,
    dropped_unknown: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let prefix = Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            dropped_unknown: AtomicU64::new(0),
        }
    }

    pub fn register(
        &self,
        command_type: CommandType,
        timeout: Duration,
    ) -> (String, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        let correlation_id = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let candidate = format!("{}-{}", self.prefix, seq);
            if !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(
            correlation_id.clone(),
            PendingRequest {
                correlation_id: correlation_id.clone(),
                command_type,
                issued_at: Instant::now(),
                timeout,
                resolver: tx,
            },
        );
        self.issued.fetch_add(1, Ordering::Relaxed);
        (correlation_id, rx)
    }

    /// Delivers a response to its caller. Returns `false` when the id is not
    /// outstanding; such responses are counted and dropped.
    pub fn resolve(&self, envelope: ResponseEnvelope) -> bool {
        let Some(request) = self.pending.lock().remove(&envelope.correlation_id) else {
            self.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                correlation_id = %envelope.correlation_id,
                "dropping response with unknown correlation id"
            );
            return false;
        };

        let outcome = match envelope.status {
            ResponseStatus::Success => Ok(envelope.data),
            ResponseStatus::Error => Err(BridgeError::Backend {
                command_type: request.command_type,
                message: envelope.error_message(),
            }),
        };
        tracing::debug!(
            correlation_id = %request.correlation_id,
            command_type = %request.command_type,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            "resolved pending request"
        );
        self.resolved.fetch_add(1, Ordering::Relaxed);
        let _ = request.resolver.send(outcome);
        true
    }

    /// Fails one request, e.g. when its response was unparseable.
    pub fn fail(&self, correlation_id: &str, error: BridgeError) -> bool {
        let Some(request) = self.pending.lock().remove(correlation_id) else {
            self.dropped_unknown.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let _ = request.resolver.send(Err(error));
        true
    }

    /// Called by the waiter whose timer fired first.
    pub fn expire(&self, correlation_id: &str) -> bool {
        let removed = self.pending.lock().remove(correlation_id);
        match removed {
            Some(request) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    correlation_id,
                    command_type = %request.command_type,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "pending request timed out"
                );
                true
            }
            None => false,
        }
    }

    /// Forgets a request that was never sent.
    pub fn cancel(&self, correlation_id: &str) {
        self.pending.lock().remove(correlation_id);
    }

    /// Fails every outstanding request. Returns how many were failed.
    pub fn fail_all<F>(&self, make_error: F) -> usize
    where
        F: Fn() -> BridgeError,
    {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        for request in drained {
            let _ = request.resolver.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live: self.len(),
            issued: self.issued.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped_unknown: self.dropped_unknown.load(Ordering::Relaxed),
        }
    }
}
