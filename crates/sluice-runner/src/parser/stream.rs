//! Streaming parser for `read`.
//!
//! Runs for the whole lifetime of the connector process and routes every
//! message as soon as it arrives: records and checkpoints to the
//! [`DataConsumer`], logs and traces to the [`TaskLogger`]. A malformed line
//! or a rejected record ends the stream with an error; the caller is
//! responsible for terminating the process afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use sluice_protocol::{LogLevel, Message, ParsedLine, Record, State, parse_line};
use tokio::io::AsyncRead;

use super::RawLines;

use crate::error::{RunnerError, RunnerResult};
use crate::representation::{StreamRepresentations, TransformError};
use crate::task::{DataConsumer, TaskLogger};

/// Counters for one `read` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadSummary {
    /// Records handed to the consumer.
    pub records: u64,
    /// Records of streams without a representation.
    pub dropped_records: u64,
    pub states: u64,
    /// LOG and TRACE messages forwarded to the task logger.
    pub logs: u64,
    /// Messages with a discriminator this version does not know.
    pub unknown: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Map a connector log level onto the `log` facade.
pub fn log_level(level: LogLevel) -> log::Level {
    match level {
        LogLevel::Fatal | LogLevel::Error => log::Level::Error,
        LogLevel::Warn => log::Level::Warn,
        LogLevel::Info => log::Level::Info,
        LogLevel::Debug => log::Level::Debug,
        LogLevel::Trace => log::Level::Trace,
    }
}

pub struct AsynchronousParser {
    consumer: Arc<dyn DataConsumer>,
    representations: Arc<StreamRepresentations>,
    logger: Arc<dyn TaskLogger>,
    prefix: String,
    summary: ReadSummary,
}

impl AsynchronousParser {
    pub fn new(
        consumer: Arc<dyn DataConsumer>,
        representations: Arc<StreamRepresentations>,
        logger: Arc<dyn TaskLogger>,
    ) -> Self {
        Self {
            consumer,
            representations,
            logger,
            prefix: String::new(),
            summary: ReadSummary::default(),
        }
    }

    /// Prefix for lines forwarded to the task logger, e.g. `[source-id]`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Consume `reader` until EOF or the first aborting error.
    pub async fn consume<R>(mut self, reader: R) -> RunnerResult<ReadSummary>
    where
        R: AsyncRead + Unpin,
    {
        self.summary.started_at = Some(Utc::now());
        let mut lines = RawLines::new(reader);

        while let Some(raw) = lines
            .next_line()
            .await
            .map_err(|e| RunnerError::Process(format!("failed reading connector output: {}", e)))?
        {
            let line = std::str::from_utf8(raw).map_err(|e| {
                RunnerError::ProtocolViolation(format!(
                    "line is not valid UTF-8 ({}): {}",
                    e,
                    truncate(&String::from_utf8_lossy(raw), 512)
                ))
            })?;
            self.handle_line(line)?;
        }

        self.summary.finished_at = Some(Utc::now());
        Ok(self.summary)
    }

    /// Route one line of connector output.
    pub fn handle_line(&mut self, line: &str) -> RunnerResult<()> {
        if line.trim().is_empty() {
            return Ok(());
        }

        let message = match parse_line(line) {
            Ok(ParsedLine::Message(message)) => message,
            Ok(ParsedLine::Unknown(kind)) => {
                self.summary.unknown += 1;
                warn!("skipping connector message of unknown type {}", kind);
                self.forward(log::Level::Warn, &format!("unknown message type: {}", kind));
                return Ok(());
            }
            Err(e) => {
                return Err(RunnerError::ProtocolViolation(format!(
                    "{} in line: {}",
                    e,
                    truncate(line, 512)
                )));
            }
        };

        match message {
            Message::Record { record } => self.handle_record(record),
            Message::State { state } => self.handle_state(&state),
            Message::Log { log } => {
                self.summary.logs += 1;
                let mut text = log.message;
                if let Some(stack) = log.stack_trace {
                    text.push('\n');
                    text.push_str(&stack);
                }
                self.forward(log_level(log.level), &text);
                Ok(())
            }
            Message::Trace { trace } => {
                self.summary.logs += 1;
                let level = if trace.is_error() {
                    log::Level::Error
                } else {
                    log::Level::Info
                };
                self.forward(level, &trace.summary());
                Ok(())
            }
            other => {
                self.forward(
                    log::Level::Warn,
                    &format!("unexpected {} message during read", other.message_type()),
                );
                Ok(())
            }
        }
    }

    fn handle_record(&mut self, record: Record) -> RunnerResult<()> {
        let Some(repr) = self.representations.get(&record.stream) else {
            self.summary.dropped_records += 1;
            debug!("dropping record of unselected stream {}", record.stream);
            return Ok(());
        };

        let shaped = repr.transform(&record).map_err(|e| match e {
            TransformError::NotAnObject { .. } => RunnerError::ProtocolViolation(e.to_string()),
            TransformError::MissingKey { .. } => RunnerError::Consumer {
                what: format!("record of stream {}", record.stream),
                message: e.to_string(),
            },
        })?;

        self.consumer
            .consume_record(repr.destination_name(), shaped)
            .map_err(|e| RunnerError::Consumer {
                what: format!("record of stream {}", record.stream),
                message: format!("{:#}", e),
            })?;
        self.summary.records += 1;
        Ok(())
    }

    fn handle_state(&mut self, state: &State) -> RunnerResult<()> {
        self.consumer
            .consume_state(state)
            .map_err(|e| RunnerError::Consumer {
                what: "state".to_string(),
                message: format!("{:#}", e),
            })?;
        self.summary.states += 1;
        debug!("checkpoint after {} records", self.summary.records);
        Ok(())
    }

    fn forward(&self, level: log::Level, message: &str) {
        if self.prefix.is_empty() {
            self.logger.log(level, message);
        } else {
            self.logger.log(level, &format!("{} {}", self.prefix, message));
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
