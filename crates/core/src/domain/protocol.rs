//! JSON control messages exchanged during the handshake
//!
//! Every control message is an envelope `{"type": ..., "data": ...}`.
//! Browser clients often send numbers taken straight from form inputs, so
//! integer fields also accept strings holding an integer.

use crate::domain::audio::{AudioConfig, AudioError, OutputDevice};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Close code for "the server hit an operational error"
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close reasons must fit in a single control frame
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

pub const CONFIG_TYPE: &str = "config";
pub const SELECT_DEVICE_TYPE: &str = "select_device";

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while decoding client messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload is not a JSON object envelope
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("invalid audio configuration: {0}")]
    InvalidConfig(#[from] AudioError),
}

/// A decoded client control message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Config(ConfigPayload),
    SelectDevice(Value),
    /// Any other `type`, or an envelope without one
    Other(Option<String>),
}

impl ClientMessage {
    pub fn kind(&self) -> &str {
        match self {
            ClientMessage::Config(_) => CONFIG_TYPE,
            ClientMessage::SelectDevice(_) => SELECT_DEVICE_TYPE,
            ClientMessage::Other(Some(kind)) => kind,
            ClientMessage::Other(None) => "<untyped>",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
    #[serde(default)]
    data: Value,
}

/// Decode one control message from its JSON text
pub fn decode_client_message(text: &str) -> Result<ClientMessage> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed(
            "expected a JSON object".to_string(),
        ));
    }
    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = match envelope.kind {
        Some(Value::String(kind)) => kind,
        Some(other) => return Ok(ClientMessage::Other(Some(other.to_string()))),
        None => return Ok(ClientMessage::Other(None)),
    };

    Ok(match kind.as_str() {
        CONFIG_TYPE => ClientMessage::Config(ConfigPayload(envelope.data)),
        SELECT_DEVICE_TYPE => ClientMessage::SelectDevice(envelope.data),
        _ => ClientMessage::Other(Some(kind)),
    })
}

/// Raw `data` of a `config` message, validated by [`ConfigPayload::into_config`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPayload(pub Value);

impl ConfigPayload {
    pub fn into_config(self) -> Result<AudioConfig> {
        let sample_rate = integer_field::<u32>(&self.0, "sampleRate")?;
        let channels = integer_field::<u16>(&self.0, "channels")?;
        let width = integer_field::<u8>(&self.0, "sampleWidthBytes")?;
        let frames_per_buffer = integer_field::<u32>(&self.0, "framesPerBuffer")?;

        Ok(AudioConfig::new(sample_rate, channels, width, frames_per_buffer)?)
    }
}

fn integer_field<T>(data: &Value, field: &'static str) -> Result<T>
where
    T: TryFrom<i64>,
{
    let value = data.get(field).ok_or(ProtocolError::MissingField(field))?;
    let number = parse_integer(value).ok_or_else(|| ProtocolError::InvalidField {
        field,
        reason: format!("expected an integer, got {}", value),
    })?;
    T::try_from(number).map_err(|_| ProtocolError::InvalidField {
        field,
        reason: format!("{} is out of range", number),
    })
}

/// Interpret a JSON value as an integer
///
/// Accepts integers, floats without a fractional part, and strings holding
/// an integer.
pub fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Messages the server sends to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Devices(Vec<OutputDevice>),
}

impl ServerMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Status code and diagnostic sent when the server closes a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_INTERNAL_ERROR,
            reason: truncate_reason(reason.into()),
        }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        let mut end = MAX_CLOSE_REASON_BYTES;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
