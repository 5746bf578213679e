//! Mapping from a source stream to the shape the data consumer expects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sluice_protocol::{ConfiguredStream, Record, Stream};
use thiserror::Error;

/// Stream representations keyed by source stream name.
pub type StreamRepresentations = HashMap<String, StreamRepresentation>;

/// Errors shaping a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("record data for stream {stream} is not a JSON object")]
    NotAnObject { stream: String },

    #[error("record for stream {stream} is missing key field {field}")]
    MissingKey { stream: String, field: String },
}

/// How records of one source stream are shaped before they reach the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRepresentation {
    pub stream_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Name of the destination collection, when it differs from the stream name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_fields: Vec<String>,
    /// JSON schema; only its top-level `properties` are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

impl StreamRepresentation {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Build a representation from a discovered stream: its schema and the
    /// first component of each source-defined primary key.
    pub fn from_stream(stream: &Stream) -> Self {
        let key_fields = stream
            .source_defined_primary_key
            .iter()
            .filter_map(|path| path.first().cloned())
            .collect();
        Self {
            stream_name: stream.name.clone(),
            namespace: stream.namespace.clone(),
            destination: None,
            key_fields,
            schema: (!stream.json_schema.is_null()).then(|| stream.json_schema.clone()),
        }
    }

    /// Build a representation from a configured stream. A user-chosen
    /// primary key takes precedence over the source-defined one.
    pub fn from_configured(configured: &ConfiguredStream) -> Self {
        let mut repr = Self::from_stream(&configured.stream);
        if !configured.primary_key.is_empty() {
            repr.key_fields = configured
                .primary_key
                .iter()
                .filter_map(|path| path.first().cloned())
                .collect();
        }
        repr
    }

    /// Name the consumer stores records under.
    pub fn destination_name(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.stream_name)
    }

    fn declared_properties(&self) -> Option<&Map<String, Value>> {
        self.schema
            .as_ref()?
            .get("properties")?
            .as_object()
            .filter(|props| !props.is_empty())
    }

    /// Shape one record: keep declared properties and key fields, and
    /// require every key field to be present.
    pub fn transform(&self, record: &Record) -> Result<Map<String, Value>, TransformError> {
        let Some(data) = record.data.as_object() else {
            return Err(TransformError::NotAnObject {
                stream: record.stream.clone(),
            });
        };

        let shaped: Map<String, Value> = match self.declared_properties() {
            Some(props) => data
                .iter()
                .filter(|(k, _)| props.contains_key(k.as_str()) || self.key_fields.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => data.clone(),
        };

        if let Some(field) = self
            .key_fields
            .iter()
            .find(|f| !shaped.contains_key(f.as_str()))
        {
            return Err(TransformError::MissingKey {
                stream: record.stream.clone(),
                field: field.clone(),
            });
        }

        Ok(shaped)
    }
}

/// Index representations by stream name.
pub fn index<I>(representations: I) -> StreamRepresentations
where
    I: IntoIterator<Item = StreamRepresentation>,
{
    representations
        .into_iter()
        .map(|r| (r.stream_name.clone(), r))
        .collect()
}
