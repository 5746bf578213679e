//! Connector runner.
//!
//! A [`Runner`] is bound to one connector image and version and executes at
//! most one protocol command (`spec`, `check`, `discover` or `read`) in a
//! container. Once that command has finished, or the runner was closed
//! explicitly or by its deadline, every further call fails with
//! [`RunnerError::AlreadyTerminated`].
//!
//! The handle is cheap to clone. Clones share the same process and the same
//! closed state, which is how the deadline watchdog and the stdout activity
//! terminate an invocation from the side.

mod process;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error};
use serde::Serialize;
use sluice_protocol::{Catalog, ConnectorSpecification, Message, MessageType, Status};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::container::{ImageRuntime, sanitize_container_name};
use crate::error::{RunnerError, RunnerResult};
use crate::materialize::materialize;
use crate::parser::{AsynchronousParser, ReadSummary, SynchronousParser};
use crate::representation::StreamRepresentations;
use crate::task::{DataConsumer, TaskCloser, TaskLogger};

use process::{ConnectorCommand, Invocation, StderrRoute};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CATALOG_FILE_NAME: &str = "catalog.json";
pub const STATE_FILE_NAME: &str = "state.json";

const SPEC_ERROR_PREFIX: &str = "Error loading connector spec:";
const CHECK_ERROR_PREFIX: &str = "Error executing connector check:";
const DISCOVER_ERROR_PREFIX: &str = "Error loading connector catalog:";

const OPEN: u8 = 0;

/// Why a runner was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// `close()` from the caller, a failing stdout activity, or normal completion.
    Requested = 1,
    /// The invocation deadline elapsed.
    Deadline = 2,
}

impl CloseReason {
    fn from_state(state: u8) -> Option<Self> {
        match state {
            1 => Some(CloseReason::Requested),
            2 => Some(CloseReason::Deadline),
            _ => None,
        }
    }
}

/// Per-command deadlines. `discover` takes its deadline per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub spec: Duration,
    pub check: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            spec: Duration::from_secs(60),
            check: Duration::from_secs(60),
            read: Duration::from_secs(24 * 60 * 60),
        }
    }
}

struct Inner {
    image: String,
    version: String,
    identifier: String,
    runtime: Arc<dyn ImageRuntime>,
    timeouts: Timeouts,
    /// OPEN, or the `CloseReason` that won the race to close.
    state: AtomicU8,
    started: AtomicBool,
    shutdown: CancellationToken,
    command_line: Mutex<Option<String>>,
}

/// Builder for [`Runner`].
pub struct RunnerBuilder {
    image: String,
    version: String,
    identifier: Option<String>,
    runtime: Arc<dyn ImageRuntime>,
    timeouts: Timeouts,
}

impl RunnerBuilder {
    /// Container name. Defaults to `<image>-<version>-<uuid>`.
    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> Runner {
        let identifier = self.identifier.unwrap_or_else(|| {
            sanitize_container_name(&format!(
                "{}-{}-{}",
                self.image,
                self.version,
                Uuid::new_v4()
            ))
        });

        Runner {
            inner: Arc::new(Inner {
                image: self.image,
                version: self.version,
                identifier,
                runtime: self.runtime,
                timeouts: self.timeouts,
                state: AtomicU8::new(OPEN),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                command_line: Mutex::new(None),
            }),
        }
    }
}

/// Executes one connector command in a container.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

impl Runner {
    pub fn builder(
        image: impl Into<String>,
        version: impl Into<String>,
        runtime: Arc<dyn ImageRuntime>,
    ) -> RunnerBuilder {
        RunnerBuilder {
            image: image.into(),
            version: version.into(),
            identifier: None,
            runtime,
            timeouts: Timeouts::default(),
        }
    }

    pub fn new(
        image: impl Into<String>,
        version: impl Into<String>,
        runtime: Arc<dyn ImageRuntime>,
    ) -> Self {
        Self::builder(image, version, runtime).build()
    }

    pub fn image(&self) -> &str {
        &self.inner.image
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// The last command line this runner executed, or an empty string.
    pub fn describe(&self) -> String {
        self.inner
            .command_line
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Why the runner was closed, if it was.
    pub fn close_reason(&self) -> Option<CloseReason> {
        CloseReason::from_state(self.inner.state.load(Ordering::Acquire))
    }

    /// Stop the container and kill the process.
    ///
    /// Only the first close of a runner does anything; every later one,
    /// from any clone or from the deadline, returns `AlreadyTerminated`.
    pub fn close(&self) -> RunnerResult<()> {
        self.terminate(CloseReason::Requested)
    }

    pub(crate) fn terminate(&self, reason: CloseReason) -> RunnerResult<()> {
        if self
            .inner
            .state
            .compare_exchange(OPEN, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RunnerError::AlreadyTerminated);
        }

        // Wakes the exit future, which kills the process, and the watchdog.
        self.inner.shutdown.cancel();

        // Nothing was ever started, so there is no container to stop.
        if !self.inner.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let runtime = self.inner.runtime.clone();
        let name = self.inner.identifier.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = runtime.stop_container(&name).await {
                        debug!("container stop for {} returned: {}", name, e);
                    }
                });
            }
            Err(_) => error!("no async runtime available to stop container {}", name),
        }

        Ok(())
    }

    fn close_ignoring_terminated(&self) {
        match self.close() {
            Ok(()) => {}
            Err(e) if e.is_already_terminated() => {}
            Err(e) => error!("[{}] closing connector runner: {}", self.inner.identifier, e),
        }
    }

    fn ensure_open(&self) -> RunnerResult<()> {
        if self.is_closed() || self.inner.started.load(Ordering::Acquire) {
            return Err(RunnerError::AlreadyTerminated);
        }
        Ok(())
    }

    /// Claim the runner's single invocation and record its command line.
    fn begin(&self, binary: &str, argv: &[String]) -> RunnerResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(RunnerError::AlreadyTerminated);
        }
        let line = std::iter::once(binary)
            .chain(argv.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        *self
            .inner
            .command_line
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(line);
        Ok(())
    }

    /// Run a command whose result is a single message of type `desired`.
    async fn run_synchronous(
        &self,
        desired: MessageType,
        command: ConnectorCommand,
        prefix: &str,
        route: StderrRoute,
    ) -> RunnerResult<Message> {
        let handler = move |stdout: ChildStdout| async move {
            let mut parser = SynchronousParser::new(desired);
            parser.consume(stdout).await;
            Ok::<_, RunnerError>(parser)
        };

        let Invocation {
            stdout,
            stderr,
            result,
        } = self.run(command, handler, route).await?;

        let (output, message) = match stdout {
            Some(parser) => (parser.output().to_string(), parser.into_result()),
            None => (String::new(), None),
        };

        let err = match (result, message) {
            (Ok(()), Some(message)) => return Ok(message),
            (Ok(()), None) => RunnerError::ProtocolViolation(format!(
                "connector did not emit a {} message",
                desired
            )),
            (Err(e), _) => e,
        };

        let message = self
            .inner
            .runtime
            .build_diagnostic_message(prefix, &output, &stderr, &err);
        error!("{}", message);
        Err(RunnerError::Diagnosed {
            message,
            source: Box::new(err),
        })
    }

    /// Run `spec` and return the connector's specification.
    pub async fn spec(&self) -> RunnerResult<ConnectorSpecification> {
        let command = ConnectorCommand {
            name: "spec",
            args: Vec::new(),
            mount: false,
            timeout: self.inner.timeouts.spec,
        };
        match self
            .run_synchronous(
                MessageType::Spec,
                command,
                SPEC_ERROR_PREFIX,
                StderrRoute::capture(),
            )
            .await?
        {
            Message::Spec { spec } => Ok(spec),
            other => Err(unexpected(other, MessageType::Spec)),
        }
    }

    /// Run `check` against `config`. `Ok` only if the connector reported
    /// SUCCEEDED.
    pub async fn check<C: Serialize + ?Sized>(&self, config: &C) -> RunnerResult<()> {
        self.ensure_open()?;
        let artifact = materialize(self.inner.runtime.config_dir(), config)?;

        let command = ConnectorCommand {
            name: "check",
            args: vec![
                "--config".to_string(),
                artifact.mounted_path(self.inner.runtime.mount_alias()),
            ],
            mount: true,
            timeout: self.inner.timeouts.check,
        };
        let message = self
            .run_synchronous(
                MessageType::ConnectionStatus,
                command,
                CHECK_ERROR_PREFIX,
                StderrRoute::capture(),
            )
            .await?;
        drop(artifact);

        let status = match message {
            Message::ConnectionStatus { connection_status } => connection_status,
            other => return Err(unexpected(other, MessageType::ConnectionStatus)),
        };
        match status.status {
            Status::Succeeded => Ok(()),
            Status::Failed => Err(RunnerError::ConnectorFailure(status.message)),
            Status::Other(other) => Err(RunnerError::UnknownStatus {
                status: other,
                message: status.message,
            }),
        }
    }

    /// Run `discover` against `config` and return the catalog.
    pub async fn discover<C: Serialize + ?Sized>(
        &self,
        config: &C,
        timeout: Duration,
    ) -> RunnerResult<Catalog> {
        self.ensure_open()?;
        let artifact = materialize(self.inner.runtime.config_dir(), config)?;

        let command = ConnectorCommand {
            name: "discover",
            args: vec![
                "--config".to_string(),
                artifact.mounted_path(self.inner.runtime.mount_alias()),
            ],
            mount: true,
            timeout,
        };
        let message = self
            .run_synchronous(
                MessageType::Catalog,
                command,
                DISCOVER_ERROR_PREFIX,
                StderrRoute::capture().with_prefix("[discover]"),
            )
            .await?;
        drop(artifact);

        match message {
            Message::Catalog { catalog } => Ok(catalog),
            other => Err(unexpected(other, MessageType::Catalog)),
        }
    }

    /// Run `read`, pushing records and checkpoints to `consumer` as they
    /// arrive.
    ///
    /// Config, catalog and state are expected under
    /// `<mount alias>/<source_id>/<image>/`; `--state` is only passed when
    /// `state_path` is non-empty. A malformed line or a rejected record
    /// closes the task through `closer` as non-fatal, an internal fault as
    /// fatal. Both close the runner before this returns.
    pub async fn read(
        &self,
        consumer: Arc<dyn DataConsumer>,
        representations: Arc<StreamRepresentations>,
        logger: Arc<dyn TaskLogger>,
        closer: Arc<dyn TaskCloser>,
        source_id: &str,
        state_path: &str,
    ) -> RunnerResult<ReadSummary> {
        let base = format!(
            "{}/{}/{}",
            self.inner.runtime.mount_alias().trim_end_matches('/'),
            source_id,
            self.inner.image
        );
        let mut args = vec![
            "--config".to_string(),
            format!("{}/{}", base, CONFIG_FILE_NAME),
            "--catalog".to_string(),
            format!("{}/{}", base, CATALOG_FILE_NAME),
        ];
        if !state_path.is_empty() {
            args.push("--state".to_string());
            args.push(format!("{}/{}", base, STATE_FILE_NAME));
        }
        let command = ConnectorCommand {
            name: "read",
            args,
            mount: true,
            timeout: self.inner.timeouts.read,
        };

        let prefix = format!("[{}]", source_id);
        let parser = AsynchronousParser::new(consumer, representations, logger.clone())
            .with_prefix(prefix.clone());
        let runner = self.clone();
        let exec_logger = logger.clone();
        let handler_closer = closer.clone();
        let handler = move |stdout: ChildStdout| {
            exec_logger.info(&format!(
                "ID [{}] exec: {}",
                handler_closer.task_id(),
                runner.describe()
            ));
            async move {
                match parser.consume(stdout).await {
                    Ok(summary) => Ok(summary),
                    Err(e) => {
                        handler_closer.close_with_error(
                            &format!("Process error: {}. Process will be killed", e),
                            false,
                        );
                        match runner.close() {
                            Ok(()) => {}
                            Err(close_err) if close_err.is_already_terminated() => {}
                            Err(close_err) => error!(
                                "[{}] closing connector runner: {}",
                                handler_closer.task_id(),
                                close_err
                            ),
                        }
                        Err(e)
                    }
                }
            }
        };

        let route = StderrRoute::to_logger(logger.clone()).with_prefix(prefix);
        let invocation = self.run(command, handler, route).await?;

        match invocation.result {
            Ok(()) => Ok(invocation.stdout.unwrap_or_default()),
            Err(e) => {
                if e.is_fatal() {
                    closer.close_with_error(&format!("{}. Process will be killed", e), true);
                }
                logger.error(&format!("read of source {} failed: {}", source_id, e));
                Err(e)
            }
        }
    }
}

fn unexpected(message: Message, desired: MessageType) -> RunnerError {
    RunnerError::ProtocolViolation(format!(
        "expected a {} message, got {}",
        desired,
        message.message_type()
    ))
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("image", &self.inner.image)
            .field("version", &self.inner.version)
            .field("identifier", &self.inner.identifier)
            .field("close_reason", &self.close_reason())
            .finish()
    }
}
