//! Shared fixtures for diaginject tests.
//!
//! [`FakeTransport`] stands in for the cluster: extraction drains the tar
//! stream it is fed, and the helper script follows a scripted
//! [`ScriptBehavior`]. [`TestContext`] runs a real coordinator on a socket in
//! a temp dir against that transport.

use async_trait::async_trait;
use diaginject::exec::{ExecConnector, ExecTransport, StreamSet};
use diaginject::{Coordinator, CoordinatorConfig, DiagnosticClient, JobReport};
use diaginject_shared::{InjectorError, InjectorResult, PodKey};
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long fixtures wait for an asynchronous event before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where test helpers are extracted inside the (fake) container.
pub const HELPER_DEST: &str = "/tmp/diaginject/helpers";

/// Trimmed stdout of a real linperf run.
pub const LINPERF_STDOUT: &str = "\
linperf.sh version: 1.5
Tue Jul 23 13:30:44 UTC 2025
Collecting 240 seconds of data at 30 second intervals
Gathering process list...
Collecting javacores: 1 of 8
Collection complete.
Compressing results...
Results are in /serviceability/olo-test/example-75dfd65979-mwvnz/performanceData/linperf_RESULTS_sample.20250723.133044.tar.gz
";

/// Artifact path inside [`LINPERF_STDOUT`].
pub const LINPERF_ARTIFACT: &str = "/serviceability/olo-test/example-75dfd65979-mwvnz/performanceData/linperf_RESULTS_sample.20250723.133044.tar.gz";

// ============================================================================
// FAKE TRANSPORT
// ============================================================================

/// What the fake does with the `tar -xf -` call.
#[derive(Clone, Debug)]
pub enum ExtractBehavior {
    /// Read the whole archive and succeed.
    Drain,
    /// Fail with a non-zero exit and this message on stderr.
    Fail(String),
    /// Block until canceled.
    Hang,
}

/// What the fake does with the `/bin/sh -c` call.
#[derive(Clone, Debug)]
pub enum ScriptBehavior {
    Succeed { stdout: String, stderr: String },
    Fail { code: i32, stderr: String },
    /// Block until canceled.
    Hang,
    /// Block until `release` fires, then succeed with `stdout`.
    WaitFor {
        release: CancellationToken,
        stdout: String,
    },
}

impl ScriptBehavior {
    /// A linperf run that prints its artifact path.
    pub fn linperf() -> Self {
        Self::Succeed {
            stdout: LINPERF_STDOUT.to_string(),
            stderr: String::new(),
        }
    }
}

/// One `run` call the fake received.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub target: PodKey,
    pub command: Vec<String>,
    /// Everything read from stdin.
    pub stdin: Vec<u8>,
    pub canceled: bool,
}

impl RecordedCall {
    pub fn is_extract(&self) -> bool {
        self.command.first().is_some_and(|c| c == "tar")
    }
}

/// Scripted [`ExecTransport`].
pub struct FakeTransport {
    extract: Mutex<ExtractBehavior>,
    script: Mutex<ScriptBehavior>,
    calls: Mutex<Vec<RecordedCall>>,
    script_started: Notify,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new(ScriptBehavior::linperf())
    }
}

impl FakeTransport {
    pub fn new(script: ScriptBehavior) -> Self {
        Self {
            extract: Mutex::new(ExtractBehavior::Drain),
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
            script_started: Notify::new(),
        }
    }

    pub fn set_extract(&self, behavior: ExtractBehavior) {
        *self.extract.lock() = behavior;
    }

    pub fn set_script(&self, behavior: ScriptBehavior) {
        *self.script.lock() = behavior;
    }

    /// Calls completed so far, in completion order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Wait until a helper script starts running.
    pub async fn script_started(&self) {
        tokio::time::timeout(EVENT_TIMEOUT, self.script_started.notified())
            .await
            .expect("helper script never started");
    }

    async fn extract(
        &self,
        stdin: &mut Vec<u8>,
        streams: StreamSet,
        cancel: &CancellationToken,
    ) -> InjectorResult<()> {
        let behavior = self.extract.lock().clone();
        match behavior {
            ExtractBehavior::Drain => {
                let Some(mut reader) = streams.stdin else {
                    return Ok(());
                };
                tokio::select! {
                    _ = cancel.cancelled() => Err(InjectorError::Canceled),
                    res = reader.read_to_end(stdin) => res
                        .map(|_| ())
                        .map_err(|e| InjectorError::StreamFailed(e.to_string())),
                }
            }
            ExtractBehavior::Fail(message) => {
                write_all(streams.stderr, &message).await;
                Err(InjectorError::RemoteExitNonZero { code: 2, message })
            }
            ExtractBehavior::Hang => {
                cancel.cancelled().await;
                Err(InjectorError::Canceled)
            }
        }
    }

    async fn script(&self, streams: StreamSet, cancel: &CancellationToken) -> InjectorResult<()> {
        self.script_started.notify_one();
        let behavior = self.script.lock().clone();
        match behavior {
            ScriptBehavior::Succeed { stdout, stderr } => {
                write_all(streams.stdout, &stdout).await;
                write_all(streams.stderr, &stderr).await;
                Ok(())
            }
            ScriptBehavior::Fail { code, stderr } => {
                write_all(streams.stderr, &stderr).await;
                Err(InjectorError::RemoteExitNonZero {
                    code,
                    message: stderr,
                })
            }
            ScriptBehavior::Hang => {
                cancel.cancelled().await;
                Err(InjectorError::Canceled)
            }
            ScriptBehavior::WaitFor { release, stdout } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(InjectorError::Canceled),
                    _ = release.cancelled() => {
                        write_all(streams.stdout, &stdout).await;
                        Ok(())
                    }
                }
            }
        }
    }
}

async fn write_all(writer: Option<diaginject::exec::BoxedWriter>, text: &str) {
    if let Some(mut writer) = writer {
        let _ = writer.write_all(text.as_bytes()).await;
        let _ = writer.shutdown().await;
    }
}

#[async_trait]
impl ExecTransport for FakeTransport {
    async fn run(
        &self,
        target: &PodKey,
        command: Vec<String>,
        streams: StreamSet,
        cancel: CancellationToken,
    ) -> InjectorResult<()> {
        let mut stdin = Vec::new();
        let is_extract = command.first().is_some_and(|c| c == "tar");

        let result = if cancel.is_cancelled() {
            Err(InjectorError::Canceled)
        } else if is_extract {
            self.extract(&mut stdin, streams, &cancel).await
        } else {
            self.script(streams, &cancel).await
        };

        self.calls.lock().push(RecordedCall {
            target: target.clone(),
            command,
            stdin,
            canceled: matches!(result, Err(InjectorError::Canceled)),
        });
        result
    }
}

/// Hands out a shared [`FakeTransport`], or fails like an unreachable cluster.
pub struct FakeConnector {
    transport: Option<Arc<FakeTransport>>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self {
            transport: Some(transport),
            connects: AtomicUsize::new(0),
        }
    }

    /// Every connect fails with `ClientBuildFailed`.
    pub fn failing() -> Self {
        Self {
            transport: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecConnector for FakeConnector {
    async fn connect(&self) -> InjectorResult<Arc<dyn ExecTransport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.transport {
            Some(transport) => Ok(transport.clone()),
            None => Err(InjectorError::ClientBuildFailed(
                "no kubeconfig available".into(),
            )),
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Helper tree: an executable script, a nested library and a symlink.
pub fn create_helper_tree(dir: &Path) {
    fs::create_dir_all(dir.join("lib")).unwrap();
    fs::write(dir.join("linperf.sh"), b"#!/bin/sh\necho linperf\n").unwrap();
    fs::set_permissions(dir.join("linperf.sh"), fs::Permissions::from_mode(0o755)).unwrap();
    fs::write(dir.join("lib/common.sh"), b"collect() { :; }\n").unwrap();
    std::os::unix::fs::symlink("lib/common.sh", dir.join("common.sh")).unwrap();
}

pub fn pod(name: &str) -> PodKey {
    PodKey::new(name, "olo-test")
}

/// A coordinator serving on a temp socket against a [`FakeTransport`].
pub struct TestContext {
    pub coordinator: Coordinator,
    pub transport: Arc<FakeTransport>,
    pub reports: broadcast::Receiver<JobReport>,
    server: JoinHandle<InjectorResult<()>>,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    pub async fn new(max_workers: usize) -> Self {
        let transport = Arc::new(FakeTransport::default());
        let connector = Arc::new(FakeConnector::new(transport.clone()));
        Self::with_connector(max_workers, transport, connector).await
    }

    pub async fn with_script(max_workers: usize, script: ScriptBehavior) -> Self {
        let transport = Arc::new(FakeTransport::new(script));
        let connector = Arc::new(FakeConnector::new(transport.clone()));
        Self::with_connector(max_workers, transport, connector).await
    }

    pub async fn with_connector(
        max_workers: usize,
        transport: Arc<FakeTransport>,
        connector: Arc<dyn ExecConnector>,
    ) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let helper_src = temp_dir.path().join("helpers");
        create_helper_tree(&helper_src);

        let config = CoordinatorConfig {
            socket_path: temp_dir.path().join("run/operator.sock"),
            max_workers,
            helper_src_dir: helper_src,
            helper_dest_dir: PathBuf::from(HELPER_DEST),
            ..Default::default()
        };
        let coordinator = Coordinator::new(config, connector).expect("Failed to create coordinator");
        let reports = coordinator.subscribe();
        let listener = coordinator.bind().expect("Failed to bind socket");

        let serving = coordinator.clone();
        let server = tokio::spawn(async move { serving.serve(listener).await });

        Self {
            coordinator,
            transport,
            reports,
            server,
            _temp_dir: temp_dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.coordinator.config().socket_path
    }

    pub async fn client(&self) -> DiagnosticClient {
        DiagnosticClient::connect(self.socket_path())
            .await
            .expect("Failed to connect to coordinator")
    }

    /// Next completion report, failing the test after [`EVENT_TIMEOUT`].
    pub async fn next_report(&mut self) -> JobReport {
        tokio::time::timeout(EVENT_TIMEOUT, self.reports.recv())
            .await
            .expect("no job completed in time")
            .expect("report channel closed")
    }

    /// Ordered shutdown; returns the accept loop's result.
    pub async fn shutdown(self) -> InjectorResult<()> {
        self.coordinator.shutdown().await;
        self.server
            .await
            .map_err(|e| InjectorError::Internal(e.to_string()))?
    }
}
