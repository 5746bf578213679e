//! Protocol message types.
//!
//! Every line a connector prints on stdout is one JSON object. The `type`
//! field names the kind of message and the payload sits under a key named
//! after that kind (`connectionStatus` for `CONNECTION_STATUS`, and so on).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::Catalog;

// ============================================================================
// Discriminator
// ============================================================================

/// The `type` discriminator of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Spec,
    ConnectionStatus,
    Catalog,
    Record,
    State,
    Log,
    Trace,
}

impl MessageType {
    /// All discriminators known to this protocol version.
    pub const ALL: [MessageType; 7] = [
        MessageType::Spec,
        MessageType::ConnectionStatus,
        MessageType::Catalog,
        MessageType::Record,
        MessageType::State,
        MessageType::Log,
        MessageType::Trace,
    ];

    /// Wire name of the discriminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Spec => "SPEC",
            MessageType::ConnectionStatus => "CONNECTION_STATUS",
            MessageType::Catalog => "CATALOG",
            MessageType::Record => "RECORD",
            MessageType::State => "STATE",
            MessageType::Log => "LOG",
            MessageType::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a discriminator is not one of [`MessageType::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type '{0}'")]
pub struct UnknownMessageType(pub String);

impl std::str::FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownMessageType(s.to_string()))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Spec {
        spec: ConnectorSpecification,
    },
    ConnectionStatus {
        #[serde(rename = "connectionStatus")]
        connection_status: ConnectionStatus,
    },
    Catalog {
        catalog: Catalog,
    },
    Record {
        record: Record,
    },
    State {
        state: State,
    },
    Log {
        log: Log,
    },
    Trace {
        trace: Trace,
    },
}

impl Message {
    /// Discriminator of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Spec { .. } => MessageType::Spec,
            Message::ConnectionStatus { .. } => MessageType::ConnectionStatus,
            Message::Catalog { .. } => MessageType::Catalog,
            Message::Record { .. } => MessageType::Record,
            Message::State { .. } => MessageType::State,
            Message::Log { .. } => MessageType::Log,
            Message::Trace { .. } => MessageType::Trace,
        }
    }
}

// ============================================================================
// SPEC
// ============================================================================

/// Connector specification returned by the `spec` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpecification {
    #[serde(
        rename = "documentationUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub documentation_url: Option<String>,

    #[serde(rename = "changelogUrl", default, skip_serializing_if = "Option::is_none")]
    pub changelog_url: Option<String>,

    /// JSON schema of the configuration object the connector accepts.
    #[serde(rename = "connectionSpecification", default)]
    pub connection_specification: Value,

    #[serde(
        rename = "supportsIncremental",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub supports_incremental: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_destination_sync_modes: Vec<String>,

    /// Fields this version of the protocol does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// CONNECTION_STATUS
// ============================================================================

/// Outcome of a `check` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: Status,
    #[serde(default)]
    pub message: String,
}

/// Connection check status. Values outside the known pair are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    Succeeded,
    Failed,
    Other(String),
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SUCCEEDED" => Status::Succeeded,
            "FAILED" => Status::Failed,
            _ => Status::Other(value),
        }
    }
}

impl From<Status> for String {
    fn from(status: Status) -> Self {
        status.to_string()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Succeeded => f.write_str("SUCCEEDED"),
            Status::Failed => f.write_str("FAILED"),
            Status::Other(s) => f.write_str(s),
        }
    }
}

// ============================================================================
// RECORD / STATE
// ============================================================================

/// One extracted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub data: Value,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<i64>,
}

/// Opaque checkpoint. Passed back to a later `read` to resume extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(pub Value);

impl State {
    /// Legacy connectors nest the checkpoint under `data`; newer ones use typed
    /// per-stream or global state. Returns `data` when present, else the whole value.
    pub fn data(&self) -> &Value {
        self.0.get("data").unwrap_or(&self.0)
    }
}

// ============================================================================
// LOG / TRACE
// ============================================================================

/// Log line emitted by the connector through the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Connector log severity. Unrecognized values decode as `Info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<String> for LogLevel {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "FATAL" => LogLevel::Fatal,
            "ERROR" => LogLevel::Error,
            "WARN" | "WARNING" => LogLevel::Warn,
            "DEBUG" => LogLevel::Debug,
            "TRACE" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

impl From<LogLevel> for &'static str {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

/// Structured trace (errors, estimates, stream status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    #[serde(rename = "type")]
    pub trace_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emitted_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TraceError>,
    /// ESTIMATE, STREAM_STATUS and future trace payloads.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an `ERROR` trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceError {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,
}

impl Trace {
    pub fn is_error(&self) -> bool {
        self.trace_type == "ERROR"
    }

    /// Human-readable one-line summary used when forwarding to a task log.
    pub fn summary(&self) -> String {
        match &self.error {
            Some(err) => match &err.internal_message {
                Some(internal) => format!("{}: {}", err.message, internal),
                None => err.message.clone(),
            },
            None => {
                let body = serde_json::to_string(&self.extra).unwrap_or_default();
                format!("{} {}", self.trace_type, body)
            }
        }
    }
}
