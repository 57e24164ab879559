//! Injection job.
//!
//! One job ships the helper directory into a container and runs the helper:
//!
//! 1. a producer on the blocking pool writes a tar of the helper tree into a
//!    bounded in-memory pipe;
//! 2. the driver runs `tar -xf - -C <parent>` in the container, fed from the
//!    pipe;
//! 3. if extraction succeeded, the driver runs the helper script through
//!    `/bin/sh -c` and captures its output;
//! 4. the completion callback runs exactly once with the captured output and
//!    the terminal result.
//!
//! Both exec calls share one cancellation token. A failed extraction is
//! terminal: the script is not attempted.

use crate::archive::{extraction_parent, spawn_producer};
use crate::exec::{CaptureBuffer, DiagnosticSink, ExecConnector, LogLevel, StreamSet};
use crate::pipe::{PipeHandle, byte_pipe};
use diaginject_shared::constants::helper::SHELL;
use diaginject_shared::{InjectorError, InjectorResult, PodKey};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// What a job needs to run.
#[derive(Clone, Debug)]
pub struct JobSpec {
    pub target: PodKey,
    pub helper_src: PathBuf,
    pub helper_dest: PathBuf,
    /// Script passed to `/bin/sh -c`.
    pub script: String,
    pub pipe_capacity: usize,
}

/// Terminal state of a job, handed to the completion callback.
#[derive(Debug)]
pub struct JobOutcome {
    pub stdout: String,
    pub stderr: String,
    pub result: InjectorResult<()>,
}

impl JobOutcome {
    /// Outcome of a job that never produced output.
    pub fn failed(error: InjectorError) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            result: Err(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Completion callback; invoked exactly once per launched job.
pub type OnDone = Box<dyn FnOnce(JobOutcome) + Send + 'static>;

/// Handle to a launched job.
#[derive(Debug)]
pub struct JobHandle {
    pipe: PipeHandle,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub fn pipe(&self) -> &PipeHandle {
        &self.pipe
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel both exec calls and close the pipe.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.pipe.close();
    }

    /// Wait for the driver, completion callback included.
    pub async fn join(self) -> InjectorResult<()> {
        self.task
            .await
            .map_err(|e| InjectorError::Internal(format!("job driver panicked: {}", e)))
    }
}

/// Starts injection jobs against a connector.
#[derive(Clone)]
pub struct JobLauncher {
    connector: Arc<dyn ExecConnector>,
    tracker: TaskTracker,
}

impl JobLauncher {
    /// Driver tasks are spawned on `tracker`, so the owner can wait for every
    /// completion callback during shutdown.
    pub fn new(connector: Arc<dyn ExecConnector>, tracker: TaskTracker) -> Self {
        Self { connector, tracker }
    }

    /// Launch a job. `cancel` becomes the job's token; pass a child of a
    /// parent token to have the job follow the parent's cancellation.
    ///
    /// # Errors
    ///
    /// Returns `ClientBuildFailed` if no transport could be obtained, or
    /// `Config` if the helper destination has no parent to extract into. In
    /// both cases nothing was spawned and `on_done` is dropped uncalled; the
    /// caller reports the error itself.
    pub async fn start(
        &self,
        spec: JobSpec,
        cancel: CancellationToken,
        on_done: OnDone,
    ) -> InjectorResult<JobHandle> {
        let parent = extraction_parent(&spec.helper_dest)
            .map_err(|e| InjectorError::Config(e.to_string()))?
            .to_path_buf();
        let transport = self.connector.connect().await?;

        let (reader, writer, pipe) = byte_pipe(spec.pipe_capacity);
        let producer = spawn_producer(spec.helper_src.clone(), spec.helper_dest.clone(), writer);

        let label = spec.target.to_string();
        let driver_pipe = pipe.clone();
        let driver_cancel = cancel.clone();

        let task = self.tracker.spawn(async move {
            let extract = vec![
                "tar".to_string(),
                "-xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                parent.to_string_lossy().into_owned(),
            ];
            let streams = StreamSet::new()
                .stdin(reader)
                .stdout(DiagnosticSink::new(label.clone(), "stdout", LogLevel::Debug))
                .stderr(DiagnosticSink::new(label.clone(), "stderr", LogLevel::Warn));

            let extracted = transport
                .run(&spec.target, extract, streams, driver_cancel.clone())
                .await;
            if extracted.is_err() {
                // Unblocks a producer still waiting for buffer space.
                driver_pipe.close();
            }
            let produced = match producer.await {
                Ok(res) => res.map(|_| ()),
                Err(e) => Err(InjectorError::Internal(format!("tar producer panicked: {}", e))),
            };

            let outcome = match extracted.and(produced) {
                Err(e) => {
                    warn!(pod = %label, error = %e, "helper extraction failed");
                    JobOutcome::failed(e)
                }
                Ok(()) if driver_cancel.is_cancelled() => JobOutcome::failed(InjectorError::Canceled),
                Ok(()) => {
                    debug!(pod = %label, "helper extracted, running script");
                    let stdout = CaptureBuffer::new();
                    let stderr = CaptureBuffer::new();
                    let streams = StreamSet::new()
                        .stdout(stdout.clone())
                        .stderr(stderr.clone());
                    let command = vec![SHELL.to_string(), "-c".to_string(), spec.script];
                    let result = transport
                        .run(&spec.target, command, streams, driver_cancel)
                        .await;
                    JobOutcome {
                        stdout: stdout.text(),
                        stderr: stderr.text(),
                        result,
                    }
                }
            };

            driver_pipe.close();
            match &outcome.result {
                Ok(()) => info!(pod = %label, "injection finished"),
                Err(e) => info!(pod = %label, error = %e, "injection ended with error"),
            }
            on_done(outcome);
        });

        Ok(JobHandle { pipe, cancel, task })
    }
}
