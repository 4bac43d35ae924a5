use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `kind` of unsolicited messages carrying a single debug event.
pub const DEBUG_EVENT_KIND: &str = "debug_event";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    #[default]
    Info,
    Started,
    Success,
    Warning,
    Error,
    #[serde(other)]
    Other,
}

/// One backend trace record as buffered by the event consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DebugEvent {
    /// Local arrival sequence, assigned by the buffer. Zero until buffered.
    #[serde(default)]
    pub seq: u64,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "event_type")]
    pub kind: String,
    #[serde(alias = "agent")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(
        default,
        alias = "correlation_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl DebugEvent {
    /// Extracts the event from a `{kind: "debug_event", event: {...}}` push.
    pub fn from_push(message: &Value) -> Result<Self, serde_json::Error> {
        let event = message.get("event").cloned().unwrap_or(Value::Null);
        serde_json::from_value(event)
    }
}

/// Accepts either a bare array of events or `{events: [...]}`.
pub fn parse_event_batch(data: Value) -> Result<Vec<DebugEvent>, serde_json::Error> {
    match data {
        Value::Object(mut obj) => match obj.remove("events") {
            Some(events) => serde_json::from_value(events),
            None => Ok(Vec::new()),
        },
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other),
    }
}

/// Debug console query. Also sent as the `get_events` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    #[serde(default, alias = "start_time", skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, alias = "end_time", skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    #[serde(default, alias = "event_types", skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<String>,
    #[serde(default, alias = "agents", skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    #[serde(default, alias = "correlation_id", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn since(cursor: DateTime<Utc>) -> Self {
        Self {
            since: Some(cursor),
            ..Self::default()
        }
    }

    /// Both bounds are inclusive, as on the backend.
    pub fn matches(&self, event: &DebugEvent) -> bool {
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.iter().any(|k| k == &event.kind) {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == &event.source) {
            return false;
        }
        if let Some(id) = &self.correlation_id {
            if event.correlation_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        true
    }
}

// Backends emit RFC 3339, naive ISO-8601 (treated as UTC) or epoch seconds.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(raw) => parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp: {raw}"))),
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| D::Error::custom("timestamp out of range"))?;
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| D::Error::custom("timestamp out of range"))
        }
        other => Err(D::Error::custom(format!(
            "expected timestamp string or number, got {other}"
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_event(ts: &str, kind: &str, agent: &str) -> Value {
        json!({
            "timestamp": ts,
            "event_type": kind,
            "agent": agent,
            "action": "plan",
            "details": {"step": 1},
            "status": "success",
            "correlation_id": "c-1"
        })
    }

    #[test]
    fn parses_backend_field_names_and_naive_timestamps() {
        let event: DebugEvent =
            serde_json::from_value(raw_event("2024-05-01T10:00:00.250", "agent_call", "planner"))
                .unwrap();
        assert_eq!(event.kind, "agent_call");
        assert_eq!(event.source, "planner");
        assert_eq!(event.status, EventStatus::Success);
        assert_eq!(event.timestamp.timestamp_millis() % 1000, 250);
        assert_eq!(event.seq, 0);
    }

    #[test]
    fn unknown_status_maps_to_other() {
        let mut raw = raw_event("2024-05-01T10:00:00Z", "x", "y");
        raw["status"] = json!("pending_review");
        let event: DebugEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.status, EventStatus::Other);
    }

    #[test]
    fn push_and_batch_shapes() {
        let push = json!({"kind": DEBUG_EVENT_KIND, "event": raw_event("2024-05-01T10:00:00Z", "a", "b")});
        assert_eq!(DebugEvent::from_push(&push).unwrap().kind, "a");

        let wrapped = json!({"events": [raw_event("2024-05-01T10:00:00Z", "a", "b")]});
        assert_eq!(parse_event_batch(wrapped).unwrap().len(), 1);
        assert!(parse_event_batch(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn query_filters_by_cursor_and_fields() {
        let event: DebugEvent =
            serde_json::from_value(raw_event("2024-05-01T10:00:00Z", "agent_call", "planner"))
                .unwrap();
        assert!(EventQuery::default().matches(&event));
        assert!(EventQuery::since(event.timestamp).matches(&event));
        let later = event.timestamp + chrono::Duration::seconds(1);
        assert!(!EventQuery::since(later).matches(&event));

        let query = EventQuery {
            sources: vec!["coder".to_string()],
            ..EventQuery::default()
        };
        assert!(!query.matches(&event));

        let query = EventQuery {
            correlation_id: Some("c-1".to_string()),
            kinds: vec!["agent_call".to_string()],
            ..EventQuery::default()
        };
        assert!(query.matches(&event));
    }
}
