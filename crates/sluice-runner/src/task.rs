//! Collaborators a `read` invocation reports to.
//!
//! The runner never owns these. They belong to the task that scheduled the
//! read and may be shared between several background activities of one
//! runner, hence `Send + Sync` and `&self` receivers throughout.

use serde_json::{Map, Value};
use sluice_protocol::State;

/// Destination for extracted records and checkpoints.
pub trait DataConsumer: Send + Sync {
    /// Accept one transformed record of `stream`. Called in emission order.
    fn consume_record(&self, stream: &str, record: Map<String, Value>) -> anyhow::Result<()>;

    /// Accept a checkpoint. Everything consumed before it is covered by it.
    fn consume_state(&self, state: &State) -> anyhow::Result<()>;
}

/// Leveled log sink of the owning task.
pub trait TaskLogger: Send + Sync {
    fn log(&self, level: log::Level, message: &str);

    fn info(&self, message: &str) {
        self.log(log::Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(log::Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(log::Level::Error, message);
    }
}

/// Records the terminal failure of the owning task.
pub trait TaskCloser: Send + Sync {
    fn task_id(&self) -> &str;

    /// Mark the task failed. `fatal` failures must not be retried.
    fn close_with_error(&self, message: &str, fatal: bool);
}

/// [`TaskLogger`] that forwards to the `log` facade under a fixed target.
#[derive(Debug, Clone)]
pub struct LogTaskLogger {
    target: String,
}

impl LogTaskLogger {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Default for LogTaskLogger {
    fn default() -> Self {
        Self::new("sluice::task")
    }
}

impl TaskLogger for LogTaskLogger {
    fn log(&self, level: log::Level, message: &str) {
        log::log!(target: &self.target, level, "{}", message);
    }
}
