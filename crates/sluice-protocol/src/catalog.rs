//! Catalog types: the discovered catalog produced by `discover` and the
//! configured catalog passed to `read --catalog`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Set of streams a source connector can extract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub streams: Vec<Stream>,
}

impl Catalog {
    /// Stream names in catalog order.
    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// A discoverable stream.
///
/// Decodes from either a full stream object or a bare stream name; some
/// connectors only list names during discovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StreamRepr")]
pub struct Stream {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub json_schema: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_sync_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_defined_cursor: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_cursor_field: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_defined_primary_key: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Stream {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Streams selected for a `read`, with how each one is synced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    #[serde(default)]
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Select every stream of a discovered catalog in full refresh mode.
    pub fn from_discovered(catalog: Catalog) -> Self {
        Self {
            streams: catalog
                .streams
                .into_iter()
                .map(|stream| ConfiguredStream {
                    stream,
                    sync_mode: "full_refresh".to_string(),
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: Stream,
    #[serde(default)]
    pub sync_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_sync_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cursor_field: Vec<String>,
    /// Primary key chosen by the user; overrides the source-defined one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StreamRepr {
    Name(String),
    Described {
        name: String,
        #[serde(default)]
        json_schema: Value,
        #[serde(default)]
        supported_sync_modes: Vec<String>,
        #[serde(default)]
        source_defined_cursor: Option<bool>,
        #[serde(default)]
        default_cursor_field: Vec<String>,
        #[serde(default)]
        source_defined_primary_key: Vec<Vec<String>>,
        #[serde(default)]
        namespace: Option<String>,
    },
}

impl From<StreamRepr> for Stream {
    fn from(repr: StreamRepr) -> Self {
        match repr {
            StreamRepr::Name(name) => Stream::named(name),
            StreamRepr::Described {
                name,
                json_schema,
                supported_sync_modes,
                source_defined_cursor,
                default_cursor_field,
                source_defined_primary_key,
                namespace,
            } => Stream {
                name,
                json_schema,
                supported_sync_modes,
                source_defined_cursor,
                default_cursor_field,
                source_defined_primary_key,
                namespace,
            },
        }
    }
}
