//! Relay wire protocol: JSON array frames and subscription filters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::Event;

/// Server-side query descriptor sent with a REQ.
///
/// `None` fields are omitted on the wire. Tag queries use the `#`-prefixed
/// field names relays expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(rename = "#a", skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter requires at least one of authors or kinds")]
    MissingCriteria,
}

/// Builder for [`Filter`]. `build` fails unless at least one of authors or
/// kinds is non-empty; relays reject unconstrained queries.
#[derive(Debug, Default)]
pub struct FilterBuilder {
    filter: Filter,
}

impl FilterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.filter.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn coordinate(mut self, coordinate: impl Into<String>) -> Self {
        self.filter
            .coordinates
            .get_or_insert_with(Vec::new)
            .push(coordinate.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.filter.since = Some(since);
        self
    }

    /// Set `since` only when a cursor exists; a hard refresh passes None.
    pub fn maybe_since(mut self, since: Option<u64>) -> Self {
        self.filter.since = since;
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.filter.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.filter.limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<Filter, FilterError> {
        let has_authors = self
            .filter
            .authors
            .as_ref()
            .is_some_and(|a| !a.is_empty());
        let has_kinds = self.filter.kinds.as_ref().is_some_and(|k| !k.is_empty());
        if !has_authors && !has_kinds {
            return Err(FilterError::MissingCriteria);
        }
        Ok(self.filter)
    }
}

/// Client-to-relay frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: String,
        filter: Filter,
    },
    Event {
        event: Event,
    },
    Close {
        subscription_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        match self {
            ClientMessage::Req {
                subscription_id,
                filter,
            } => json!(["REQ", subscription_id, filter]).to_string(),
            ClientMessage::Event { event } => json!(["EVENT", event]).to_string(),
            ClientMessage::Close { subscription_id } => {
                json!(["CLOSE", subscription_id]).to_string()
            }
        }
    }
}

/// Relay-to-client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Event,
    },
    EndOfStoredEvents {
        subscription_id: String,
    },
    Closed {
        subscription_id: String,
        reason: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown frame type {0:?}")]
    UnknownFrame(String),
}

impl RelayMessage {
    /// Parse one inbound text frame. Callers drop errors with a diagnostic;
    /// a bad frame never tears the connection down.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let arr = value
            .as_array()
            .ok_or_else(|| ProtocolError::Malformed("frame is not an array".into()))?;
        let frame_type = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing frame type".into()))?;

        match frame_type {
            "EVENT" => {
                let subscription_id = str_at(arr, 1)?;
                let event = arr
                    .get(2)
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed("EVENT without body".into()))?;
                let event: Event = serde_json::from_value(event)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "EOSE" => Ok(RelayMessage::EndOfStoredEvents {
                subscription_id: str_at(arr, 1)?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: str_at(arr, 1)?,
                reason: str_at(arr, 2).unwrap_or_default(),
            }),
            "OK" => Ok(RelayMessage::Ok {
                event_id: str_at(arr, 1)?,
                accepted: arr.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: str_at(arr, 3).unwrap_or_default(),
            }),
            other => Err(ProtocolError::UnknownFrame(other.to_string())),
        }
    }
}

fn str_at(arr: &[Value], index: usize) -> Result<String, ProtocolError> {
    arr.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing string at index {index}")))
}
