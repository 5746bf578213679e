//! Test doubles: a container runtime that runs a shell script instead of an
//! image, plus recording task collaborators.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sluice_runner::container::ContainerResult;
use sluice_runner::protocol::State;
use sluice_runner::{DataConsumer, ImageRuntime, Runner, TaskCloser, TaskLogger, Timeouts};
use tempfile::TempDir;

/// Runs `/bin/sh <script> run --rm -i --name ...` in place of `docker run ...`.
///
/// The temp dir doubles as workspace volume, mount alias and config dir, so
/// files the runner materializes are readable by the script under the path
/// it is given.
pub struct FakeRuntime {
    dir: TempDir,
    dir_str: String,
    script: PathBuf,
    pulled: AtomicBool,
    stops: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(script_body: &str) -> Arc<Self> {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("connector.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
        let dir_str = dir.path().to_str().unwrap().to_string();
        Arc::new(Self {
            dir,
            dir_str,
            script,
            pulled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
        })
    }

    /// Script body produced from the workspace path, for scripts that need
    /// to leave files behind for the test to inspect.
    pub fn with_dir(body: impl FnOnce(&Path) -> String) -> Arc<Self> {
        let rt = Self::new("");
        std::fs::write(&rt.script, format!("#!/bin/sh\n{}\n", body(rt.dir.path()))).unwrap();
        rt
    }

    pub fn set_pulled(&self, pulled: bool) {
        self.pulled.store(pulled, Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Entries in the workspace other than the script itself.
    pub fn workspace_entries(&self) -> usize {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path() != self.script)
            .count()
    }

    pub fn runner(self: &Arc<Self>) -> Runner {
        self.runner_with_timeouts(Timeouts::default())
    }

    pub fn runner_with_timeouts(self: &Arc<Self>, timeouts: Timeouts) -> Runner {
        Runner::builder("source-fake", "1.0", self.clone() as Arc<dyn ImageRuntime>)
            .identifier(format!("sluice-test-{}", uuid::Uuid::new_v4().simple()))
            .timeouts(timeouts)
            .build()
    }
}

#[async_trait]
impl ImageRuntime for FakeRuntime {
    fn binary(&self) -> &str {
        "/bin/sh"
    }

    fn global_args(&self) -> Vec<String> {
        vec![self.script.display().to_string()]
    }

    async fn is_pulled(&self, _image: &str, _version: &str) -> bool {
        self.pulled.load(Ordering::SeqCst)
    }

    fn qualify(&self, image: &str) -> String {
        format!("test/{}", image)
    }

    fn workspace_volume(&self) -> &str {
        &self.dir_str
    }

    fn mount_alias(&self) -> &str {
        &self.dir_str
    }

    fn config_dir(&self) -> &Path {
        self.dir.path()
    }

    async fn stop_container(&self, _name: &str) -> ContainerResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wait until `cond` holds, polling every 10ms for up to 5s.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[derive(Default)]
pub struct RecordingConsumer {
    pub records: Mutex<Vec<(String, Value)>>,
    pub states: Mutex<Vec<Value>>,
    /// Records of this stream panic the consumer.
    pub panic_on: Option<String>,
}

impl DataConsumer for RecordingConsumer {
    fn consume_record(&self, stream: &str, record: Map<String, Value>) -> anyhow::Result<()> {
        if self.panic_on.as_deref() == Some(stream) {
            panic!("consumer cannot handle stream {stream}");
        }
        self.records
            .lock()
            .unwrap()
            .push((stream.to_string(), Value::Object(record)));
        Ok(())
    }

    fn consume_state(&self, state: &State) -> anyhow::Result<()> {
        self.states.lock().unwrap().push(state.0.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLogger {
    pub lines: Mutex<Vec<(log::Level, String)>>,
}

impl RecordingLogger {
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(_, line)| line.contains(needle))
    }
}

impl TaskLogger for RecordingLogger {
    fn log(&self, level: log::Level, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

pub struct RecordingCloser {
    pub task_id: String,
    pub closed: Mutex<Vec<(String, bool)>>,
}

impl RecordingCloser {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            closed: Mutex::new(Vec::new()),
        }
    }
}

impl TaskCloser for RecordingCloser {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn close_with_error(&self, message: &str, fatal: bool) {
        self.closed
            .lock()
            .unwrap()
            .push((message.to_string(), fatal));
    }
}
