//! Relay wire protocol
//!
//! Nostr relay messages are JSON arrays with a leading type label. Every
//! accepted shape is spelled out here as a tagged variant; anything else is
//! rejected with [`WireError::InvalidRelayMessage`] rather than passed
//! through loosely typed.

use nightjar_core::types::{Event, Filter};
use serde_json::{json, Value};
use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Message was valid JSON but not a shape we accept
    #[error("invalid relay message: {0}")]
    InvalidRelayMessage(String),

    /// Message was not valid JSON at all
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client → relay messages.
#[derive(Clone, Debug)]
pub enum ClientMessage {
    /// `["EVENT", event]`
    Event(Event),
    /// `["REQ", sub_id, filter, …]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]`
    Close { subscription_id: String },
    /// `["AUTH", event]`
    Auth(Event),
}

impl ClientMessage {
    /// Encode to the wire JSON array.
    pub fn to_json(&self) -> Result<String, WireError> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut array = vec![json!("REQ"), json!(subscription_id)];
                for filter in filters {
                    array.push(serde_json::to_value(filter)?);
                }
                Value::Array(array)
            }
            ClientMessage::Close { subscription_id } => json!(["CLOSE", subscription_id]),
            ClientMessage::Auth(event) => json!(["AUTH", event]),
        };
        Ok(value.to_string())
    }
}

/// Relay → client messages.
#[derive(Clone, Debug)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]`
    Event {
        subscription_id: String,
        event: Event,
    },
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// `["EOSE", sub_id]`
    Eose { subscription_id: String },
    /// `["CLOSED", sub_id, reason]`
    Closed {
        subscription_id: String,
        reason: String,
    },
    /// `["NOTICE", message]`
    Notice { message: String },
    /// `["AUTH", challenge]`
    Auth { challenge: String },
}

fn expect_str(value: Option<&Value>, what: &str) -> Result<String, WireError> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WireError::InvalidRelayMessage(format!("missing {what}")))
}

impl RelayMessage {
    /// Decode a wire JSON array. Unknown labels and malformed arrays are
    /// rejected.
    pub fn from_json(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(array) = value.as_array() else {
            return Err(WireError::InvalidRelayMessage("not an array".into()));
        };
        let label = array
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| WireError::InvalidRelayMessage("missing label".into()))?;

        match label {
            "EVENT" => {
                if array.len() != 3 {
                    return Err(WireError::InvalidRelayMessage("EVENT needs 3 elements".into()));
                }
                let subscription_id = expect_str(array.get(1), "subscription id")?;
                let event: Event = serde_json::from_value(array[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if array.len() < 3 {
                    return Err(WireError::InvalidRelayMessage("OK needs 3+ elements".into()));
                }
                let event_id = expect_str(array.get(1), "event id")?;
                let accepted = array
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| WireError::InvalidRelayMessage("missing accepted flag".into()))?;
                let message = array
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    accepted,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: expect_str(array.get(1), "subscription id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: expect_str(array.get(1), "subscription id")?,
                reason: array
                    .get(2)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: expect_str(array.get(1), "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: expect_str(array.get(1), "challenge")?,
            }),
            other => Err(WireError::InvalidRelayMessage(format!(
                "unknown label: {other}"
            ))),
        }
    }
}
