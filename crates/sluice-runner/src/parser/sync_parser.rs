//! Single-result parser for `spec`, `check` and `discover`.

use log::{debug, warn};
use sluice_protocol::{Message, MessageType, ParsedLine, ProtocolError, parse_line};
use tokio::io::AsyncRead;

use super::RawLines;

/// Reads connector output to the end and keeps the last message of one type.
///
/// Every line is kept in [`output`](Self::output) regardless of whether it
/// matched, so a failed call can show the operator exactly what the
/// connector printed.
#[derive(Debug)]
pub struct SynchronousParser {
    desired: MessageType,
    output: String,
    result: Option<Message>,
}

impl SynchronousParser {
    pub fn new(desired: MessageType) -> Self {
        Self {
            desired,
            output: String::new(),
            result: None,
        }
    }

    /// Drain `reader` until EOF. Lines that are not valid UTF-8 are kept
    /// with replacement characters. A read error ends the stream early; it
    /// usually means the process was killed and the caller sees that from
    /// the exit status instead.
    pub async fn consume<R>(&mut self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = RawLines::new(reader);
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => self.observe(&String::from_utf8_lossy(raw)),
                Ok(None) => break,
                Err(e) => {
                    debug!("stopped reading connector output: {}", e);
                    break;
                }
            }
        }
    }

    /// Record one line of output.
    pub fn observe(&mut self, line: &str) {
        self.output.push_str(line);
        self.output.push('\n');

        if line.trim().is_empty() {
            return;
        }

        match parse_line(line) {
            Ok(ParsedLine::Message(message)) if message.message_type() == self.desired => {
                if self.result.is_some() {
                    debug!("replacing earlier {} message with a later one", self.desired);
                }
                self.result = Some(message);
            }
            Ok(_) => {}
            Err(ProtocolError::Payload {
                message_type,
                source,
            }) if message_type == self.desired => {
                warn!("ignoring {} message with invalid payload: {}", message_type, source);
            }
            Err(_) => {}
        }
    }

    /// Everything the connector printed, one line per line.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn result(&self) -> Option<&Message> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<Message> {
        self.result
    }
}
