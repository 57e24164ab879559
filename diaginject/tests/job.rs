//! Integration tests for the injection job (tar shipping + helper run).

use diaginject::job::{JobLauncher, JobOutcome, JobSpec, OnDone};
use diaginject::InjectorError;
use diaginject_test_utils::{
    EVENT_TIMEOUT, ExtractBehavior, FakeConnector, FakeTransport, HELPER_DEST, LINPERF_STDOUT,
    ScriptBehavior, create_helper_tree, pod,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct JobFixture {
    launcher: JobLauncher,
    transport: Arc<FakeTransport>,
    tracker: TaskTracker,
    helper_src: PathBuf,
    _temp_dir: TempDir,
}

impl JobFixture {
    fn new(script: ScriptBehavior) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let helper_src = temp_dir.path().join("helpers");
        create_helper_tree(&helper_src);

        let transport = Arc::new(FakeTransport::new(script));
        let tracker = TaskTracker::new();
        let launcher = JobLauncher::new(
            Arc::new(FakeConnector::new(transport.clone())),
            tracker.clone(),
        );
        Self {
            launcher,
            transport,
            tracker,
            helper_src,
            _temp_dir: temp_dir,
        }
    }

    fn spec(&self) -> JobSpec {
        JobSpec {
            target: pod("example-75dfd65979-mwvnz"),
            helper_src: self.helper_src.clone(),
            helper_dest: PathBuf::from(HELPER_DEST),
            script: "'/tmp/diaginject/helpers/linperf.sh'".to_string(),
            pipe_capacity: 512,
        }
    }
}

fn capture() -> (OnDone, oneshot::Receiver<JobOutcome>) {
    let (tx, rx) = oneshot::channel();
    let on_done: OnDone = Box::new(move |outcome| {
        let _ = tx.send(outcome);
    });
    (on_done, rx)
}

async fn outcome(rx: oneshot::Receiver<JobOutcome>) -> JobOutcome {
    tokio::time::timeout(EVENT_TIMEOUT, rx)
        .await
        .expect("job did not complete")
        .expect("completion callback dropped")
}

fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(bytes);
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect()
}

// ============================================================================
// SUCCESSFUL RUNS
// ============================================================================

#[tokio::test]
async fn job_ships_helper_then_runs_script() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    let (on_done, rx) = capture();

    fixture
        .launcher
        .start(fixture.spec(), CancellationToken::new(), on_done)
        .await
        .unwrap();
    let outcome = outcome(rx).await;

    assert!(outcome.succeeded(), "unexpected error: {:?}", outcome.result);
    assert_eq!(outcome.stdout, LINPERF_STDOUT);

    let calls = fixture.transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].command, ["tar", "-xf", "-", "-C", "/tmp/diaginject"]);
    assert_eq!(calls[1].command[..2], ["/bin/sh", "-c"]);
    assert_eq!(calls[1].command[2], "'/tmp/diaginject/helpers/linperf.sh'");

    let entries = archive_entries(&calls[0].stdin);
    assert_eq!(entries[0], "helpers");
    assert!(entries.contains(&"helpers/linperf.sh".to_string()));
    assert!(entries.contains(&"helpers/lib/common.sh".to_string()));
}

#[tokio::test]
async fn completion_callback_runs_exactly_once() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();

    let handle = fixture
        .launcher
        .start(
            fixture.spec(),
            CancellationToken::new(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    handle.join().await.unwrap();

    fixture.tracker.close();
    fixture.tracker.wait().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn failed_extraction_skips_script() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    fixture
        .transport
        .set_extract(ExtractBehavior::Fail("tar: cannot open".into()));
    let (on_done, rx) = capture();

    let handle = fixture
        .launcher
        .start(fixture.spec(), CancellationToken::new(), on_done)
        .await
        .unwrap();
    let outcome = outcome(rx).await;

    assert!(matches!(
        outcome.result,
        Err(InjectorError::RemoteExitNonZero { code: 2, .. })
    ));
    assert!(outcome.stdout.is_empty());
    assert!(fixture.transport.calls().iter().all(|c| c.is_extract()));
    assert!(handle.pipe().is_closed());
}

#[tokio::test]
async fn missing_helper_dir_is_archive_error() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    let mut spec = fixture.spec();
    spec.helper_src = PathBuf::from("/nonexistent/helpers");
    let (on_done, rx) = capture();

    fixture
        .launcher
        .start(spec, CancellationToken::new(), on_done)
        .await
        .unwrap();
    let outcome = outcome(rx).await;

    assert!(matches!(outcome.result, Err(InjectorError::Archive(_))));
    assert!(fixture.transport.calls().iter().all(|c| c.is_extract()));
}

#[tokio::test]
async fn failing_script_reports_exit_code() {
    let fixture = JobFixture::new(ScriptBehavior::Fail {
        code: 3,
        stderr: "linperf: not a java process\n".into(),
    });
    let (on_done, rx) = capture();

    fixture
        .launcher
        .start(fixture.spec(), CancellationToken::new(), on_done)
        .await
        .unwrap();
    let outcome = outcome(rx).await;

    assert!(matches!(
        outcome.result,
        Err(InjectorError::RemoteExitNonZero { code: 3, .. })
    ));
    assert_eq!(outcome.stderr, "linperf: not a java process\n");
}

#[tokio::test]
async fn connector_failure_is_returned_without_callback() {
    let temp_dir = TempDir::new().unwrap();
    create_helper_tree(&temp_dir.path().join("helpers"));
    let connector = Arc::new(FakeConnector::failing());
    let launcher = JobLauncher::new(connector.clone(), TaskTracker::new());

    let spec = JobSpec {
        target: pod("podA"),
        helper_src: temp_dir.path().join("helpers"),
        helper_dest: PathBuf::from(HELPER_DEST),
        script: "true".into(),
        pipe_capacity: 512,
    };
    let called = Arc::new(AtomicUsize::new(0));
    let counter = called.clone();
    let result = launcher
        .start(
            spec,
            CancellationToken::new(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

    assert!(matches!(result, Err(InjectorError::ClientBuildFailed(_))));
    assert_eq!(connector.connects(), 1);
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn root_destination_is_rejected() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    let mut spec = fixture.spec();
    spec.helper_dest = PathBuf::from("/");
    let (on_done, _rx) = capture();

    let result = fixture
        .launcher
        .start(spec, CancellationToken::new(), on_done)
        .await;
    assert!(matches!(result, Err(InjectorError::Config(_))));
    assert!(fixture.transport.calls().is_empty());
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn abort_mid_script_reports_canceled() {
    let fixture = JobFixture::new(ScriptBehavior::Hang);
    let (on_done, rx) = capture();

    let handle = fixture
        .launcher
        .start(fixture.spec(), CancellationToken::new(), on_done)
        .await
        .unwrap();
    fixture.transport.script_started().await;
    handle.abort();

    let outcome = outcome(rx).await;
    assert!(matches!(outcome.result, Err(InjectorError::Canceled)));
    assert!(handle.pipe().is_closed());
}

#[tokio::test]
async fn abort_mid_extraction_skips_script() {
    let fixture = JobFixture::new(ScriptBehavior::linperf());
    fixture.transport.set_extract(ExtractBehavior::Hang);
    let (on_done, rx) = capture();

    let handle = fixture
        .launcher
        .start(fixture.spec(), CancellationToken::new(), on_done)
        .await
        .unwrap();
    handle.abort();

    let outcome = outcome(rx).await;
    assert!(matches!(outcome.result, Err(InjectorError::Canceled)));
    let calls = fixture.transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].is_extract() && calls[0].canceled);
}

#[tokio::test]
async fn parent_token_cancels_job() {
    let fixture = JobFixture::new(ScriptBehavior::Hang);
    let parent = CancellationToken::new();
    let (on_done, rx) = capture();

    fixture
        .launcher
        .start(fixture.spec(), parent.child_token(), on_done)
        .await
        .unwrap();
    fixture.transport.script_started().await;
    parent.cancel();

    let outcome = outcome(rx).await;
    assert!(matches!(outcome.result, Err(InjectorError::Canceled)));
}
