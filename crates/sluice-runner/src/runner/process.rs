//! One connector invocation: spawn, drain stdout/stderr, race the deadline.

use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, warn};
use tokio::process::{ChildStderr, ChildStdout, Command};

use super::{CloseReason, Runner};
use crate::container::{validate_container_name, validate_image_name, validate_volume_path};
use crate::error::{RunnerError, RunnerResult};
use crate::parser::RawLines;
use crate::task::TaskLogger;

/// A protocol command plus its arguments.
#[derive(Debug, Clone)]
pub(crate) struct ConnectorCommand {
    pub name: &'static str,
    pub args: Vec<String>,
    /// Whether the workspace volume is mounted into the container.
    pub mount: bool,
    pub timeout: Duration,
}

/// What happened during one invocation.
///
/// `stdout` is whatever the stdout handler produced, absent when the
/// process never started or the handler failed.
#[derive(Debug)]
pub(crate) struct Invocation<T> {
    pub stdout: Option<T>,
    pub stderr: String,
    pub result: RunnerResult<()>,
}

impl<T> Invocation<T> {
    fn failed(result: RunnerResult<()>) -> Self {
        Self {
            stdout: None,
            stderr: String::new(),
            result,
        }
    }
}

/// Where connector stderr goes.
#[derive(Clone, Default)]
pub(crate) struct StderrRoute {
    capture: bool,
    prefix: Option<String>,
    logger: Option<Arc<dyn TaskLogger>>,
}

impl StderrRoute {
    /// Keep stderr in memory for diagnostics.
    pub fn capture() -> Self {
        Self {
            capture: true,
            ..Default::default()
        }
    }

    /// Forward stderr line by line to a task logger.
    pub fn to_logger(logger: Arc<dyn TaskLogger>) -> Self {
        Self {
            logger: Some(logger),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    async fn drain(self, stderr: ChildStderr) -> String {
        let mut lines = RawLines::new(stderr);
        let mut captured = String::new();

        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let line = String::from_utf8_lossy(raw);
                    if let Some(logger) = &self.logger {
                        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
                        match &self.prefix {
                            Some(prefix) => logger.info(&format!("{} {} {}", stamp, prefix, line)),
                            None => logger.info(&format!("{} {}", stamp, line)),
                        }
                    } else if let Some(prefix) = &self.prefix {
                        debug!("{} {}", prefix, line);
                    }
                    if self.capture {
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Error reading connector stderr: {}", e);
                    break;
                }
            }
        }

        captured
    }
}

/// Human-readable description of a non-successful exit.
pub(crate) fn format_exit_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    match (status.code(), signal) {
        (Some(code), _) => format!("exited with code {}", code),
        (None, Some(sig)) => {
            let sig_name = match sig {
                9 => "SIGKILL",
                15 => "SIGTERM",
                11 => "SIGSEGV",
                6 => "SIGABRT",
                _ => "",
            };
            if sig_name.is_empty() {
                format!("killed by signal {}", sig)
            } else {
                format!("killed by {} (signal {})", sig_name, sig)
            }
        }
        (None, None) => "exited (unknown status)".to_string(),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "stdout handler was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "stdout handler panicked".to_string()
    }
}

impl Runner {
    /// Run one connector command to completion.
    ///
    /// Errors that occur before the process is spawned (closed runner,
    /// image not pulled, invalid names) are returned as `Err` and leave
    /// nothing to clean up. Everything after the spawn is reported in
    /// [`Invocation::result`]; by then the runner has been closed and the
    /// process reaped.
    pub(crate) async fn run<F, Fut, T>(
        &self,
        command: ConnectorCommand,
        stdout_handler: F,
        stderr_route: StderrRoute,
    ) -> RunnerResult<Invocation<T>>
    where
        F: FnOnce(ChildStdout) -> Fut,
        Fut: Future<Output = RunnerResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;

        let runtime = self.inner.runtime.clone();
        let qualified = runtime.qualify(&self.inner.image);
        if !runtime.is_pulled(&qualified, &self.inner.version).await {
            return Err(RunnerError::NotReady {
                image: format!("{}:{}", qualified, self.inner.version),
            });
        }

        let image_ref = format!("{}:{}", qualified, self.inner.version);
        validate_image_name(&image_ref)?;
        validate_container_name(&self.inner.identifier)?;

        let mut argv = runtime.global_args();
        argv.extend(
            ["run", "--rm", "-i", "--name", self.inner.identifier.as_str()].map(String::from),
        );
        if command.mount {
            validate_volume_path(runtime.workspace_volume(), "host")?;
            validate_volume_path(runtime.mount_alias(), "container")?;
            argv.push("-v".to_string());
            argv.push(runtime.volume_mount());
        }
        argv.push(image_ref);
        argv.push(command.name.to_string());
        argv.extend(command.args);

        self.begin(runtime.binary(), &argv)?;
        debug!("[{}] exec: {}", self.inner.identifier, self.describe());

        let spawned = Command::new(runtime.binary())
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.close_ignoring_terminated();
                return Ok(Invocation::failed(Err(RunnerError::Process(format!(
                    "failed to spawn {}: {}",
                    runtime.binary(),
                    e
                )))));
            }
        };

        self.spawn_watchdog(command.timeout);

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.close_ignoring_terminated();
            let _ = child.kill().await;
            return Ok(Invocation::failed(Err(RunnerError::Process(
                "connector stdio was not captured".to_string(),
            ))));
        };

        let stdout_task = tokio::spawn(stdout_handler(stdout));
        let stderr_task = tokio::spawn(stderr_route.drain(stderr));

        // A failing stdout activity closes the runner right away so the exit
        // future below does not wait for the connector to finish on its own.
        let runner = self.clone();
        let stdout_watch = async move {
            let outcome = stdout_task.await;
            match &outcome {
                Ok(Ok(_)) => {}
                Ok(Err(_)) => runner.close_ignoring_terminated(),
                Err(_) => {
                    error!(
                        "[{}] stdout handler of {} failed unexpectedly",
                        runner.inner.identifier,
                        runner.describe()
                    );
                    runner.close_ignoring_terminated();
                }
            }
            outcome
        };

        let shutdown = self.inner.shutdown.clone();
        let exit = async move {
            tokio::select! {
                status = child.wait() => status,
                _ = shutdown.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!("kill after shutdown: {}", e);
                    }
                    child.wait().await
                }
            }
        };

        let (stdout_outcome, stderr_outcome, exit_status) =
            tokio::join!(stdout_watch, stderr_task, exit);

        let stderr_text = stderr_outcome.unwrap_or_else(|e| {
            warn!("stderr reader failed: {}", e);
            String::new()
        });

        let mut produced = None;
        let mut activity_error = None;
        let mut fault = None;
        match stdout_outcome {
            Ok(Ok(value)) => produced = Some(value),
            Ok(Err(e)) => activity_error = Some(e),
            Err(join_err) => {
                let message = panic_message(join_err);
                error!(
                    "[{}] internal fault while handling connector output: {}",
                    self.inner.identifier, message
                );
                fault = Some(message);
            }
        }

        // The close reason is final once this returns.
        self.close_ignoring_terminated();

        let result = if self.close_reason() == Some(CloseReason::Deadline) {
            Err(RunnerError::Timeout(command.timeout))
        } else if let Some(message) = fault {
            Err(RunnerError::InternalFault(message))
        } else if let Some(e) = activity_error {
            Err(e)
        } else {
            match exit_status {
                Ok(status) if status.success() => Ok(()),
                Ok(status) => Err(RunnerError::Process(format_exit_status(status))),
                Err(e) => Err(RunnerError::Process(format!(
                    "failed waiting for connector: {}",
                    e
                ))),
            }
        };

        Ok(Invocation {
            stdout: produced,
            stderr: stderr_text,
            result,
        })
    }

    /// Deadline watchdog. Exits as soon as the runner is closed.
    fn spawn_watchdog(&self, timeout: Duration) {
        let runner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = runner.inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!("[{}] connector run timeout after {:?}", runner.inner.identifier, timeout);
                    match runner.terminate(CloseReason::Deadline) {
                        Ok(()) => {}
                        Err(e) if e.is_already_terminated() => {}
                        Err(e) => error!(
                            "Error terminating connector runner [{}:{}] after timeout: {}",
                            runner.inner.image, runner.inner.version, e
                        ),
                    }
                }
            }
        });
    }
}
