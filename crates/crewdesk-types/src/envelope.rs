use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Correlated reply from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub correlation_id: String,
    pub status: ResponseStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseEnvelope {
    pub fn success(correlation_id: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ResponseStatus::Error,
            data: Value::Null,
            error: Some(Value::String(message.into())),
        }
    }

    pub fn error_message(&self) -> String {
        match &self.error {
            Some(Value::String(message)) => message.clone(),
            Some(Value::Object(obj)) => obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
            Some(other) => other.to_string(),
            None => "backend reported an error without details".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has neither correlationId nor kind")]
    Unclassified,
    #[error("response {correlation_id} is malformed: {reason}")]
    InvalidResponse {
        correlation_id: String,
        reason: String,
    },
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(ResponseEnvelope),
    Unsolicited { kind: String, message: Value },
}

impl Inbound {
    /// Frames carrying a `correlationId` are responses; anything else must
    /// carry a `kind` (older backends used `type`).
    pub fn parse(frame: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(frame)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

        let correlation_id = obj
            .get("correlationId")
            .or_else(|| obj.get("correlation_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(correlation_id) = correlation_id {
            let mut normalized = obj.clone();
            normalized.remove("correlation_id");
            normalized.insert(
                "correlationId".to_string(),
                Value::String(correlation_id.clone()),
            );
            return serde_json::from_value(Value::Object(normalized))
                .map(Inbound::Response)
                .map_err(|err| EnvelopeError::InvalidResponse {
                    correlation_id,
                    reason: err.to_string(),
                });
        }

        let kind = obj
            .get("kind")
            .or_else(|| obj.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(EnvelopeError::Unclassified)?;
        Ok(Inbound::Unsolicited {
            kind,
            message: value,
        })
    }
}
