use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crewdesk_types::{parse_event_batch, Command, DebugEvent, EventQuery, DEBUG_EVENT_KIND};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::dispatcher::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::router::{Router, SubscriberId};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug)]
struct Ring {
    events: VecDeque<DebugEvent>,
    last_seq: u64,
}

/// Bounded, ordered debug event buffer. Oldest entries are dropped on
/// overflow; `seq` is assigned on arrival and never reused.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    dropped_total: AtomicU64,
    ring: RwLock<Ring>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            dropped_total: AtomicU64::new(0),
            ring: RwLock::new(Ring {
                events: VecDeque::with_capacity(capacity.min(1024)),
                last_seq: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn push(&self, mut event: DebugEvent) -> DebugEvent {
        let mut ring = self.ring.write();
        ring.last_seq += 1;
        event.seq = ring.last_seq;
        ring.events.push_back(event.clone());
        while ring.events.len() > self.capacity {
            ring.events.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    pub fn len(&self) -> usize {
        self.ring.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the newest event ever buffered.
    pub fn watermark(&self) -> u64 {
        self.ring.read().last_seq
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<DebugEvent> {
        let ring = self.ring.read();
        let start = ring.events.len().saturating_sub(last_n);
        ring.events.iter().skip(start).cloned().collect()
    }

    /// Matching events in arrival order; `limit` keeps the newest ones.
    pub fn query(&self, query: &EventQuery) -> Vec<DebugEvent> {
        let ring = self.ring.read();
        let mut matched: Vec<DebugEvent> = ring
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let excess = matched.len().saturating_sub(limit);
            matched.drain(..excess);
        }
        matched
    }

    /// Removes every event with `seq <= watermark`, keeping later arrivals.
    pub fn remove_through(&self, watermark: u64) -> usize {
        let mut ring = self.ring.write();
        let before = ring.events.len();
        ring.events.retain(|e| e.seq > watermark);
        before - ring.events.len()
    }
}

/// Events that share a timestamp are told apart by what they say.
type EventIdentity = (String, String, Option<String>, String);

fn identity(event: &DebugEvent) -> EventIdentity {
    (
        event.kind.clone(),
        event.source.clone(),
        event.action.clone(),
        event.details.to_string(),
    )
}

/// `get_events` includes events at `since`, so the cursor also counts
/// which events at exactly that timestamp were already buffered.
#[derive(Debug, Default)]
struct PollCursor {
    at: Option<DateTime<Utc>>,
    seen_at: HashMap<EventIdentity, usize>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub buffered: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub watermark: u64,
}

/// Feeds the [`EventBuffer`] from pushed `debug_event` messages or from
/// `get_events` polls, and re-broadcasts every buffered event to the UI.
pub struct EventConsumer {
    buffer: EventBuffer,
    live: broadcast::Sender<DebugEvent>,
    poll_cursor: Mutex<PollCursor>,
    clear_lock: tokio::sync::Mutex<()>,
}

impl EventConsumer {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            buffer: EventBuffer::new(capacity),
            live,
            poll_cursor: Mutex::new(PollCursor::default()),
            clear_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.live.subscribe()
    }

    pub fn ingest(&self, event: DebugEvent) -> DebugEvent {
        let event = self.buffer.push(event);
        // No receivers is fine.
        let _ = self.live.send(event.clone());
        event
    }

    /// Subscribes to pushed `{kind: "debug_event", event}` messages.
    pub fn attach_push(self: &Arc<Self>, router: &Router) -> SubscriberId {
        let weak = Arc::downgrade(self);
        router.subscribe(DEBUG_EVENT_KIND, move |message| {
            let Some(consumer) = weak.upgrade() else { return };
            match DebugEvent::from_push(message) {
                Ok(event) => {
                    consumer.ingest(event);
                }
                Err(e) => tracing::warn!("discarding malformed debug event: {}", e),
            }
        })
    }

    /// One `get_events` round trip from the cursor. Returns how many new
    /// events were buffered.
    pub async fn poll_once(&self, dispatcher: &Dispatcher) -> Result<usize> {
        let since = self.poll_cursor.lock().at;
        let query = match since {
            Some(ts) => EventQuery::since(ts),
            None => EventQuery::default(),
        };
        let data = dispatcher.dispatch(Command::GetEvents(query)).await?;
        let mut events = parse_event_batch(data)
            .map_err(|e| BridgeError::Protocol(format!("get_events reply: {e}")))?;
        events.sort_by_key(|e| e.timestamp);

        let mut cursor = self.poll_cursor.lock();
        let newest = match (cursor.at, events.last()) {
            (Some(at), Some(last)) => Some(at.max(last.timestamp)),
            (at, last) => at.or(last.map(|e| e.timestamp)),
        };

        let mut at_cursor: HashMap<EventIdentity, usize> = HashMap::new();
        let mut at_newest: HashMap<EventIdentity, usize> = HashMap::new();
        let mut added = 0;
        for event in events {
            if Some(event.timestamp) == newest {
                *at_newest.entry(identity(&event)).or_insert(0) += 1;
            }
            if let Some(at) = cursor.at {
                if event.timestamp < at {
                    continue;
                }
                if event.timestamp == at {
                    let id = identity(&event);
                    let count = at_cursor.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count <= cursor.seen_at.get(&id).copied().unwrap_or(0) {
                        continue;
                    }
                }
            }
            self.ingest(event);
            added += 1;
        }

        if newest != cursor.at {
            cursor.seen_at.clear();
            cursor.at = newest;
        }
        for (id, count) in at_newest {
            let seen = cursor.seen_at.entry(id).or_insert(0);
            *seen = (*seen).max(count);
        }
        Ok(added)
    }

    /// Two-phase clear: note the watermark, have the backend clear its log,
    /// then drop only what was buffered before the watermark.
    pub async fn clear(&self, dispatcher: &Dispatcher) -> Result<usize> {
        self.clear_with_timeout(dispatcher, None).await
    }

    pub async fn clear_with_timeout(
        &self,
        dispatcher: &Dispatcher,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let _clearing = self.clear_lock.lock().await;
        let watermark = self.buffer.watermark();
        dispatcher
            .dispatch_with_timeout(Command::ClearLogs, timeout)
            .await?;
        let removed = self.buffer.remove_through(watermark);
        tracing::info!(removed, watermark, "cleared debug events");
        Ok(removed)
    }

    pub fn query(&self, query: &EventQuery) -> Vec<DebugEvent> {
        self.buffer.query(query)
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity(),
            dropped: self.buffer.dropped_total(),
            watermark: self.buffer.watermark(),
        }
    }
}
