//! Matches completion events from the stream to registered history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::history::{EntryId, HistoryStore};
use super::UserId;

/// Validated completion payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub token: String,
    /// Processing failure reported by the service. The request still counts
    /// as done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("field `{field}` has unexpected value {found}")]
    InvalidField { field: &'static str, found: String },
}

/// Validate a raw `message` payload.
///
/// `Ok(None)` means the payload carries no token and should be ignored.
pub fn parse_completion(data: &str) -> Result<Option<CompletionMessage>, PayloadError> {
    let value: Value = serde_json::from_str(data)?;
    let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

    let token = match object.get("token") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.is_empty() => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(PayloadError::InvalidField {
                field: "token",
                found: other.to_string(),
            })
        }
    };

    let error = match object.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(PayloadError::InvalidField {
                field: "error",
                found: other.to_string(),
            })
        }
    };

    Ok(Some(CompletionMessage { token, error }))
}

/// Outcome of feeding one stream message to the correlator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// Payload had no token.
    Ignored,
    Matched(EntryId),
    /// No `Registered` entry holds the token; the event is dropped.
    Unmatched { token: String },
}

/// Whether the stream is bound to this session's user id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Unbound,
    Matches,
    Mismatch { subscribed: UserId },
}

pub struct Correlator {
    user_id: UserId,
    identity: Identity,
}

impl Correlator {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            identity: Identity::Unbound,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Record which user id the live subscription is bound to.
    pub fn bind(&mut self, subscribed: UserId) -> Identity {
        self.identity = if subscribed == self.user_id {
            Identity::Matches
        } else {
            Identity::Mismatch { subscribed }
        };
        self.identity
    }

    pub fn correlate(
        &self,
        history: &mut HistoryStore,
        data: &str,
        done_at: DateTime<Utc>,
    ) -> Result<Correlation, PayloadError> {
        let Some(message) = parse_completion(data)? else {
            return Ok(Correlation::Ignored);
        };
        let token = message.token.clone();
        Ok(match history.complete(message, done_at) {
            Some(id) => Correlation::Matched(id),
            None => Correlation::Unmatched { token },
        })
    }
}
