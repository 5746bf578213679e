//! Wire types for the connector protocol.
//!
//! Connectors speak newline-delimited JSON on stdout. Each line carries a
//! `type` discriminator ([`MessageType`]) and a payload keyed by that type.
//! [`parse_line`] decodes the discriminator first and only then the payload,
//! so callers can tell a malformed line apart from a message of a type they
//! do not know yet.

pub mod catalog;
pub mod messages;

pub use catalog::{Catalog, ConfiguredCatalog, ConfiguredStream, Stream};
pub use messages::{
    ConnectionStatus, ConnectorSpecification, Log, LogLevel, Message, MessageType, Record, State,
    Status, Trace, TraceError, UnknownMessageType,
};

use serde_json::Value;

/// Result of decoding one stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// A message with a known discriminator and a well-formed payload.
    Message(Message),
    /// A well-formed envelope whose discriminator this version does not know.
    Unknown(String),
}

/// Errors decoding a protocol line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Not a JSON object, or no string `type` field.
    #[error("malformed protocol line: {0}")]
    Malformed(String),

    /// Known discriminator but the payload has the wrong shape.
    #[error("invalid {message_type} payload: {source}")]
    Payload {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one line of connector output.
pub fn parse_line(line: &str) -> Result<ParsedLine, ProtocolError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(ProtocolError::Malformed(
            "missing string `type` discriminator".to_string(),
        ));
    };

    let message_type = match kind.parse::<MessageType>() {
        Ok(t) => t,
        Err(_) => return Ok(ParsedLine::Unknown(kind.to_string())),
    };

    let message = serde_json::from_value::<Message>(value).map_err(|source| {
        ProtocolError::Payload {
            message_type,
            source,
        }
    })?;

    Ok(ParsedLine::Message(message))
}
