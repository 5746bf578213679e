//! Parsers for connector stdout.

pub mod stream;
pub mod sync_parser;

pub use stream::{AsynchronousParser, ReadSummary, log_level};
pub use sync_parser::SynchronousParser;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Line reader over raw connector output.
///
/// Unlike [`tokio::io::Lines`] this does not decode UTF-8, so one line of
/// Latin-1 log output does not end the stream. Lines are returned without
/// the trailing `\n` or `\r\n`.
pub(crate) struct RawLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RawLines<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    pub(crate) async fn next_line(&mut self) -> std::io::Result<Option<&[u8]>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }

        let mut line = self.buf.as_slice();
        if let Some(rest) = line.strip_suffix(b"\n") {
            line = rest.strip_suffix(b"\r").unwrap_or(rest);
        }
        Ok(Some(line))
    }
}
