//! Runner integration tests against shell-script connectors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sluice_runner::representation::index;
use sluice_runner::{CloseReason, RunnerError, StreamRepresentation, Timeouts};

mod common;
use common::{FakeRuntime, RecordingCloser, RecordingConsumer, RecordingLogger, eventually};

const SPEC_LINE: &str =
    r#"{"type":"SPEC","spec":{"documentationUrl":"https://docs.example.com","connectionSpecification":{"type":"object"}}}"#;
const LOG_LINE: &str = r#"{"type":"LOG","log":{"level":"INFO","message":"working"}}"#;

fn short(timeout: Duration) -> Timeouts {
    Timeouts {
        spec: timeout,
        check: timeout,
        read: timeout,
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_operations_after_close_fail_without_spawning() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        let runner = rt.runner();

        runner.close().unwrap();

        assert!(matches!(runner.spec().await, Err(RunnerError::AlreadyTerminated)));
        assert!(matches!(
            runner.check(&json!({"k": 1})).await,
            Err(RunnerError::AlreadyTerminated)
        ));
        assert!(matches!(
            runner.discover(&json!({}), Duration::from_secs(5)).await,
            Err(RunnerError::AlreadyTerminated)
        ));
        assert_eq!(runner.describe(), "");
        assert_eq!(rt.workspace_entries(), 0);
        assert_eq!(rt.stops(), 0);
        assert!(matches!(runner.close(), Err(RunnerError::AlreadyTerminated)));
    }

    #[tokio::test]
    async fn test_runner_executes_at_most_one_command() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        let runner = rt.runner();

        runner.spec().await.unwrap();
        assert!(runner.is_closed());

        let err = runner.spec().await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyTerminated));
    }

    #[tokio::test]
    async fn test_not_ready_is_returned_verbatim() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        rt.set_pulled(false);
        let runner = rt.runner();

        let err = runner.spec().await.unwrap_err();
        assert!(matches!(err, RunnerError::NotReady { ref image } if image == "test/source-fake:1.0"));
        assert!(!runner.is_closed());
        assert_eq!(runner.describe(), "");

        // The materialized config is cleaned up as well.
        let err = runner.check(&json!({})).await.unwrap_err();
        assert!(err.is_not_ready());
        assert_eq!(rt.workspace_entries(), 0);

        // Once the image shows up the same runner can proceed.
        rt.set_pulled(true);
        runner.spec().await.unwrap();
    }

    #[tokio::test]
    async fn test_describe_reports_command_line() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        let runner = rt.runner();
        runner.spec().await.unwrap();

        let line = runner.describe();
        assert!(line.starts_with("/bin/sh "));
        assert!(line.contains(&format!(
            "run --rm -i --name {} test/source-fake:1.0 spec",
            runner.identifier()
        )));
        assert_eq!(runner.to_string(), line);
    }

    #[tokio::test]
    async fn test_completed_run_stops_container_once() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        let runner = rt.runner();
        runner.spec().await.unwrap();

        assert!(eventually(|| rt.stops() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rt.stops(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_terminates_once() {
        let rt = FakeRuntime::new("exec sleep 30");
        let runner = rt.runner();

        let spec_runner = runner.clone();
        let spec = tokio::spawn(async move { spec_runner.spec().await });
        assert!(eventually(|| !runner.describe().is_empty()).await);

        let mut closers = Vec::new();
        for _ in 0..8 {
            let r = runner.clone();
            closers.push(tokio::spawn(async move { r.close().is_ok() }));
        }
        let mut succeeded = 0;
        for c in closers {
            if c.await.unwrap() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);

        let started = Instant::now();
        let err = spec.await.unwrap().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err.root(), RunnerError::Process(_)));
        assert_eq!(runner.close_reason(), Some(CloseReason::Requested));

        assert!(eventually(|| rt.stops() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rt.stops(), 1);
    }
}

// ============================================================================
// Timeouts
// ============================================================================

mod timeouts {
    use super::*;

    #[tokio::test]
    async fn test_hanging_connector_is_killed_at_deadline() {
        let rt = FakeRuntime::new("echo 'booting'\nexec sleep 30");
        let runner = rt.runner_with_timeouts(short(Duration::from_millis(300)));

        let started = Instant::now();
        let err = runner.spec().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
        assert!(matches!(err.root(), RunnerError::Timeout(_)));
        assert!(err.to_string().contains("booting"));
        assert_eq!(runner.close_reason(), Some(CloseReason::Deadline));

        // The deadline already closed the runner.
        assert!(matches!(runner.close(), Err(RunnerError::AlreadyTerminated)));
        assert!(eventually(|| rt.stops() == 1).await);
    }

    #[tokio::test]
    async fn test_discover_uses_per_call_deadline() {
        let rt = FakeRuntime::new("exec sleep 30");
        let runner = rt.runner();

        let started = Instant::now();
        let err = runner
            .discover(&json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err.root(), RunnerError::Timeout(_)));
        assert_eq!(rt.workspace_entries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_outcome_agrees_with_close_reason_near_deadline() {
        for _ in 0..20 {
            let rt = FakeRuntime::new(&format!("sleep 0.05\necho '{SPEC_LINE}'"));
            let runner = rt.runner_with_timeouts(short(Duration::from_millis(60)));

            match runner.spec().await {
                Ok(_) => assert_eq!(runner.close_reason(), Some(CloseReason::Requested)),
                Err(err) => {
                    assert!(matches!(err.root(), RunnerError::Timeout(_)), "{err}");
                    assert_eq!(runner.close_reason(), Some(CloseReason::Deadline));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_fast_connector_does_not_trip_deadline() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'"));
        let runner = rt.runner_with_timeouts(short(Duration::from_millis(500)));
        runner.spec().await.unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(runner.close_reason(), Some(CloseReason::Requested));
    }
}

// ============================================================================
// spec
// ============================================================================

mod spec {
    use super::*;

    #[tokio::test]
    async fn test_spec_returns_payload() {
        let rt = FakeRuntime::new(&format!("echo '{LOG_LINE}'\necho '{SPEC_LINE}'"));
        let spec = rt.runner().spec().await.unwrap();

        assert_eq!(
            spec.documentation_url.as_deref(),
            Some("https://docs.example.com")
        );
        assert_eq!(spec.connection_specification, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_missing_spec_reports_every_line() {
        let rt = FakeRuntime::new(&format!(
            "echo 'Starting connector'\necho '{LOG_LINE}'\necho 'deprecated flag' >&2"
        ));
        let err = rt.runner().spec().await.unwrap_err();

        assert!(matches!(err.root(), RunnerError::ProtocolViolation(_)));
        let text = err.to_string();
        assert!(text.starts_with("Error loading connector spec:"));
        assert!(text.contains("Starting connector"));
        assert!(text.contains(LOG_LINE));
        assert!(text.contains("deprecated flag"));
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_hide_spec() {
        let rt = FakeRuntime::new(&format!(
            "printf 'caf\\351 warming up\\n'\necho '{SPEC_LINE}'"
        ));
        let spec = rt.runner().spec().await.unwrap();
        assert_eq!(spec.connection_specification, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_non_utf8_line_is_kept_in_diagnostics() {
        let rt = FakeRuntime::new("printf 'caf\\351 warming up\\n'\necho 'still starting'");
        let err = rt.runner().spec().await.unwrap_err();

        assert!(matches!(err.root(), RunnerError::ProtocolViolation(_)));
        let text = err.to_string();
        assert!(text.contains("caf\u{fffd} warming up"));
        assert!(text.contains("still starting"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_process_error() {
        let rt = FakeRuntime::new(&format!("echo '{SPEC_LINE}'\necho 'oops' >&2\nexit 3"));
        let err = rt.runner().spec().await.unwrap_err();

        match err.root() {
            RunnerError::Process(msg) => assert_eq!(msg, "exited with code 3"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("oops"));
    }
}

// ============================================================================
// check
// ============================================================================

mod check {
    use super::*;

    fn status_line(status: &str, message: &str) -> String {
        format!(
            r#"{{"type":"CONNECTION_STATUS","connectionStatus":{{"status":"{status}","message":"{message}"}}}}"#
        )
    }

    #[tokio::test]
    async fn test_succeeded_after_interleaved_messages() {
        let rt = FakeRuntime::new(&format!(
            "echo '{LOG_LINE}'\necho '{}'\necho '{}'\necho '{}'",
            r#"{"type":"TRACE","trace":{"type":"ESTIMATE","estimate":{}}}"#,
            r#"{"type":"RECORD","record":{"stream":"x","data":{}}}"#,
            status_line("SUCCEEDED", "")
        ));
        rt.runner().check(&json!({"host": "db"})).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_status_returns_connector_message() {
        let rt = FakeRuntime::new(&format!("echo '{}'", status_line("FAILED", "bad creds")));
        let err = rt.runner().check(&json!({})).await.unwrap_err();

        assert!(matches!(err, RunnerError::ConnectorFailure(_)));
        assert_eq!(err.to_string(), "bad creds");
    }

    #[tokio::test]
    async fn test_unknown_status_names_status_and_message() {
        let rt = FakeRuntime::new(&format!("echo '{}'", status_line("PENDING", "try later")));
        let err = rt.runner().check(&json!({})).await.unwrap_err();

        match &err {
            RunnerError::UnknownStatus { status, message } => {
                assert_eq!(status, "PENDING");
                assert_eq!(message, "try later");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let text = err.to_string();
        assert!(text.contains("PENDING") && text.contains("try later"));
    }

    #[tokio::test]
    async fn test_config_is_mounted_and_removed_afterwards() {
        let succeeded = status_line("SUCCEEDED", "");
        let failed = status_line("FAILED", "config not visible");
        let rt = FakeRuntime::with_dir(|dir| {
            format!(
                r#"while [ $# -gt 0 ]; do
  case "$1" in --config) CONFIG="$2"; shift;; esac
  shift
done
echo "$CONFIG" > "{seen}"
if grep -q db.internal "$CONFIG"; then echo '{succeeded}'; else echo '{failed}'; fi"#,
                seen = dir.join("seen").display(),
            )
        });

        rt.runner()
            .check(&json!({"host": "db.internal"}))
            .await
            .unwrap();

        let seen = std::fs::read_to_string(rt.path().join("seen")).unwrap();
        let config_path = std::path::PathBuf::from(seen.trim());
        assert!(config_path.starts_with(rt.path()));
        assert!(!config_path.exists());
        assert!(!config_path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_config_removed_on_failure_too() {
        let rt = FakeRuntime::new("echo 'nothing useful'\nexit 1");
        let err = rt.runner().check(&json!({"k": "v"})).await.unwrap_err();

        assert!(err.to_string().starts_with("Error executing connector check:"));
        assert_eq!(rt.workspace_entries(), 0);
    }
}

// ============================================================================
// discover
// ============================================================================

mod discover {
    use super::*;

    #[tokio::test]
    async fn test_discover_returns_catalog_and_ignores_logs() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho '{LOG_LINE}'\necho '{LOG_LINE}'",
            r#"{"type":"CATALOG","catalog":{"streams":["a","b"]}}"#
        ));
        let catalog = rt
            .runner()
            .discover(&json!({}), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(catalog.stream_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_last_catalog_wins() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho '{}'",
            r#"{"type":"CATALOG","catalog":{"streams":["old"]}}"#,
            r#"{"type":"CATALOG","catalog":{"streams":["new"]}}"#
        ));
        let catalog = rt
            .runner()
            .discover(&json!({}), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(catalog.stream_names(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_missing_catalog_reports_output() {
        let rt = FakeRuntime::new("echo 'auth failed for user'");
        let err = rt
            .runner()
            .discover(&json!({}), Duration::from_secs(10))
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.starts_with("Error loading connector catalog:"));
        assert!(text.contains("auth failed for user"));
    }
}

// ============================================================================
// read
// ============================================================================

mod read {
    use super::*;

    struct Harness {
        consumer: Arc<RecordingConsumer>,
        logger: Arc<RecordingLogger>,
        closer: Arc<RecordingCloser>,
    }

    impl Harness {
        fn new(consumer: RecordingConsumer) -> Self {
            Self {
                consumer: Arc::new(consumer),
                logger: Arc::new(RecordingLogger::default()),
                closer: Arc::new(RecordingCloser::new("task-1")),
            }
        }

        async fn read(
            &self,
            runner: &sluice_runner::Runner,
            state_path: &str,
        ) -> sluice_runner::RunnerResult<sluice_runner::ReadSummary> {
            let reprs = index([
                StreamRepresentation::new("users"),
                StreamRepresentation::new("orders"),
            ]);
            runner
                .read(
                    self.consumer.clone(),
                    Arc::new(reprs),
                    self.logger.clone(),
                    self.closer.clone(),
                    "src-1",
                    state_path,
                )
                .await
        }
    }

    fn record(stream: &str, id: u32) -> String {
        format!(r#"{{"type":"RECORD","record":{{"stream":"{stream}","data":{{"id":{id}}}}}}}"#)
    }

    #[tokio::test]
    async fn test_records_forwarded_in_order() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho '{}'\necho '{}'\necho '{}'\necho '{}'\necho '{}'",
            record("users", 1),
            record("orders", 10),
            record("unknown_stream", 99),
            record("users", 2),
            r#"{"type":"STATE","state":{"data":{"cursor":"2024-01-01"}}}"#,
            record("users", 3),
        ));
        let h = Harness::new(RecordingConsumer::default());

        let summary = h.read(&rt.runner(), "").await.unwrap();

        assert_eq!(summary.records, 4);
        assert_eq!(summary.dropped_records, 1);
        assert_eq!(summary.states, 1);

        let records = h.consumer.records.lock().unwrap();
        let users: Vec<_> = records
            .iter()
            .filter(|(s, _)| s == "users")
            .map(|(_, v)| v["id"].as_u64().unwrap())
            .collect();
        assert_eq!(users, vec![1, 2, 3]);
        assert!(records.iter().all(|(s, _)| s != "unknown_stream"));
        assert_eq!(
            h.consumer.states.lock().unwrap().as_slice(),
            &[json!({"data": {"cursor": "2024-01-01"}})]
        );
        assert!(h.closer.closed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_arguments_follow_workspace_convention() {
        let script = r#"echo "{\"type\":\"LOG\",\"log\":{\"level\":\"INFO\",\"message\":\"args: $*\"}}"
echo 'connector warming up' >&2"#;
        let rt = FakeRuntime::new(script);
        let h = Harness::new(RecordingConsumer::default());
        let runner = rt.runner();

        h.read(&runner, "state.json").await.unwrap();

        let base = format!("{}/src-1/source-fake", rt.path().display());
        assert!(h.logger.contains(&format!("--config {base}/config.json")));
        assert!(h.logger.contains(&format!("--catalog {base}/catalog.json")));
        assert!(h.logger.contains(&format!("--state {base}/state.json")));
        assert!(h.logger.contains("[src-1] args: run --rm -i --name"));
        assert!(h.logger.contains("ID [task-1] exec: /bin/sh"));
        assert!(h.logger.contains("[src-1] connector warming up"));
    }

    #[tokio::test]
    async fn test_state_argument_omitted_without_state_path() {
        let script = r#"echo "{\"type\":\"LOG\",\"log\":{\"level\":\"INFO\",\"message\":\"args: $*\"}}""#;
        let rt = FakeRuntime::new(script);
        let h = Harness::new(RecordingConsumer::default());

        h.read(&rt.runner(), "").await.unwrap();

        assert!(h.logger.contains("--catalog"));
        assert!(!h.logger.contains("--state"));
    }

    #[tokio::test]
    async fn test_malformed_line_aborts_and_kills() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho 'Traceback (most recent call last):'\necho '{}'\nexec sleep 30",
            record("users", 1),
            record("users", 2),
        ));
        let h = Harness::new(RecordingConsumer::default());
        let runner = rt.runner();

        let started = Instant::now();
        let err = h.read(&runner, "").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, RunnerError::ProtocolViolation(_)));
        assert!(!err.is_fatal());
        assert!(runner.is_closed());
        assert_eq!(h.consumer.records.lock().unwrap().len(), 1);

        let closed = h.closer.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].0.starts_with("Process error:"));
        assert!(closed[0].0.ends_with("Process will be killed"));
        assert!(!closed[0].1);
    }

    #[tokio::test]
    async fn test_non_utf8_line_aborts_as_protocol_violation() {
        let latin1_log = r#"printf '{"type":"LOG","log":{"level":"INFO","message":"caf\351"}}\n'"#;
        let rt = FakeRuntime::new(&format!(
            "{latin1_log}\necho '{}'\nexec sleep 30",
            record("users", 1)
        ));
        let h = Harness::new(RecordingConsumer::default());
        let runner = rt.runner();

        let started = Instant::now();
        let err = h.read(&runner, "").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(err, RunnerError::ProtocolViolation(_)), "{err:?}");
        assert!(!err.is_fatal());
        assert!(runner.is_closed());
        assert!(h.consumer.records.lock().unwrap().is_empty());

        let closed = h.closer.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert!(!closed[0].1);
    }

    #[tokio::test]
    async fn test_consumer_panic_is_a_fatal_internal_fault() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho '{}'\nexec sleep 30",
            record("users", 1),
            record("orders", 2),
        ));
        let h = Harness::new(RecordingConsumer {
            panic_on: Some("orders".to_string()),
            ..Default::default()
        });
        let runner = rt.runner();

        let started = Instant::now();
        let err = h.read(&runner, "").await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("consumer cannot handle stream orders"));
        assert!(runner.is_closed());

        let closed = h.closer.closed.lock().unwrap();
        assert_eq!(closed.len(), 1);
        assert!(closed[0].1);
    }

    #[tokio::test]
    async fn test_unknown_message_types_are_tolerated() {
        let rt = FakeRuntime::new(&format!(
            "echo '{}'\necho '{}'\necho '{}'",
            r#"{"type":"CONTROL","control":{"type":"CONNECTOR_CONFIG"}}"#,
            record("users", 1),
            r#"{"type":"TRACE","trace":{"type":"ERROR","error":{"message":"rate limited"}}}"#,
        ));
        let h = Harness::new(RecordingConsumer::default());

        let summary = h.read(&rt.runner(), "").await.unwrap();

        assert_eq!(summary.unknown, 1);
        assert_eq!(summary.records, 1);
        let lines = h.logger.lines.lock().unwrap();
        assert!(lines.contains(&(log::Level::Error, "[src-1] rate limited".to_string())));
    }
}
