//! IPC endpoint and coordinator.
//!
//! The [`Coordinator`] owns the worker registry and the job launcher and
//! serves the line protocol on a Unix socket. Each connection is one task;
//! requests on a connection are handled in order.

use crate::artifact::find_artifact_path;
use crate::command::{CommandBuilder, ShellCommandBuilder};
use crate::config::CoordinatorConfig;
use crate::exec::ExecConnector;
use crate::job::{JobLauncher, JobOutcome, JobSpec, OnDone};
use crate::registry::{Admission, Worker, WorkerRegistry};
use diaginject_shared::constants::ipc::MAX_REQUEST_LEN;
use diaginject_shared::{
    Action, InjectionRequest, InjectorError, InjectorResult, PodKey, StatusResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Buffered reports per subscriber before the slowest one starts lagging.
const REPORT_CHANNEL_CAPACITY: usize = 64;

/// Back-off after a failed `accept`, so a full fd table does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Published once per completed job.
#[derive(Clone, Debug)]
pub struct JobReport {
    pub key: PodKey,
    pub generation: u64,
    pub succeeded: bool,
    /// Artifact path found in the helper's stdout, for successful runs.
    pub artifact_path: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<Arc<InjectorError>>,
}

impl JobReport {
    pub fn is_canceled(&self) -> bool {
        self.error.as_deref().is_some_and(InjectorError::is_canceled)
    }
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    registry: WorkerRegistry,
    launcher: JobLauncher,
    commands: Arc<dyn CommandBuilder>,
    reports: broadcast::Sender<JobReport>,
    shutdown: CancellationToken,
    jobs: TaskTracker,
    connections: TaskTracker,
}

/// Serves injection requests and runs the jobs they start.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Create a coordinator rendering commands with [`ShellCommandBuilder`].
    pub fn new(
        config: CoordinatorConfig,
        connector: Arc<dyn ExecConnector>,
    ) -> InjectorResult<Self> {
        let commands = Arc::new(ShellCommandBuilder::new(config.helper_dest_dir.clone()));
        Self::with_commands(config, connector, commands)
    }

    pub fn with_commands(
        config: CoordinatorConfig,
        connector: Arc<dyn ExecConnector>,
        commands: Arc<dyn CommandBuilder>,
    ) -> InjectorResult<Self> {
        config.validate()?;

        let jobs = TaskTracker::new();
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let inner = CoordinatorInner {
            registry: WorkerRegistry::new(config.max_workers),
            launcher: JobLauncher::new(connector, jobs.clone()),
            config,
            commands,
            reports,
            shutdown: CancellationToken::new(),
            jobs,
            connections: TaskTracker::new(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.inner.registry
    }

    /// Receive a [`JobReport`] for every job that completes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobReport> {
        self.inner.reports.subscribe()
    }

    /// Artifact path of the pod's latest successful run, if it printed one.
    pub fn artifact_path(&self, pod: &str) -> Option<String> {
        self.inner.registry.artifact_path(pod)
    }

    /// Apply one request.
    ///
    /// `Ok(None)` means the action has no reply (`stop`).
    ///
    /// # Errors
    ///
    /// `MalformedRequest` for a `start` carrying attributes the command
    /// builder rejects. The connection is dropped.
    pub async fn handle_request(
        &self,
        request: InjectionRequest,
    ) -> InjectorResult<Option<StatusResponse>> {
        match request.action {
            Action::Start => self.start_injection(request).await.map(Some),
            Action::Status => Ok(Some(self.inner.registry.status(&request.key.name))),
            Action::Stop => {
                if self.inner.registry.remove(&request.key.name) {
                    info!(pod = %request.key, "injection stopped");
                }
                Ok(None)
            }
        }
    }

    async fn start_injection(&self, request: InjectionRequest) -> InjectorResult<StatusResponse> {
        let config = &self.inner.config;
        // The tool field is reserved; every start runs the configured helper.
        if request.tool != config.tool {
            debug!(requested = %request.tool, tool = %config.tool, "ignoring requested tool");
        }

        let mut key = request.key;
        if key.container().is_none() && !config.default_container.is_empty() {
            key = key.with_container(config.default_container.clone());
        }
        let script = self
            .inner
            .commands
            .build(&key, &config.tool, &request.encoded_attrs)?;

        let generation = match self.inner.registry.admit(&key.name) {
            Admission::Accepted(generation) => generation,
            Admission::AlreadyPresent => {
                let reason = InjectorError::Duplicate(key.name.clone());
                debug!(pod = %key, %reason, "start not admitted");
                return Ok(StatusResponse::Writing);
            }
            Admission::Saturated => {
                info!(
                    pod = %key,
                    reason = %InjectorError::Saturated,
                    max_workers = self.inner.registry.max_workers(),
                    "start not admitted"
                );
                return Ok(StatusResponse::TooManyWorkers);
            }
        };

        info!(pod = %key, generation, "starting injection");
        let spec = JobSpec {
            target: key.clone(),
            helper_src: config.helper_src_dir.clone(),
            helper_dest: config.helper_dest_dir.clone(),
            script,
            pipe_capacity: config.pipe_capacity,
        };

        let this = self.clone();
        let done_key = key.clone();
        let on_done: OnDone =
            Box::new(move |outcome| this.finish(&done_key, generation, outcome));

        let cancel = self.inner.shutdown.child_token();
        match self.inner.launcher.start(spec, cancel, on_done).await {
            Ok(handle) => {
                let worker = Worker::new(
                    key.clone(),
                    generation,
                    handle.cancel_token().clone(),
                    handle.pipe().clone(),
                );
                if let Err(worker) = self.inner.registry.attach(&key.name, generation, worker) {
                    debug!(pod = %key, generation, "worker gone before attach");
                    worker.abort();
                }
            }
            Err(e) => {
                warn!(pod = %key, error = %e, "failed to launch injection");
                self.finish(&key, generation, JobOutcome::failed(e));
            }
        }

        Ok(StatusResponse::Writing)
    }

    /// Completion path shared by every job, launched or not.
    fn finish(&self, key: &PodKey, generation: u64, outcome: JobOutcome) {
        let succeeded = outcome.succeeded();
        let artifact_path = if succeeded {
            Some(find_artifact_path(&outcome.stdout))
                .filter(|path| !path.is_empty())
                .map(str::to_string)
        } else {
            None
        };

        let recorded =
            self.inner
                .registry
                .complete(&key.name, generation, succeeded, artifact_path.clone());
        if !recorded {
            debug!(pod = %key, generation, "result superseded by a newer injection");
        }
        if let Some(path) = &artifact_path {
            info!(pod = %key, artifact = %path, "artifact written");
        }

        let report = JobReport {
            key: key.clone(),
            generation,
            succeeded,
            artifact_path,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            error: outcome.result.err().map(Arc::new),
        };
        // Nobody listening is fine.
        let _ = self.inner.reports.send(report);
    }

    /// Bind the configured socket, replacing a stale socket file.
    pub fn bind(&self) -> InjectorResult<UnixListener> {
        let socket_path = &self.inner.config.socket_path;

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(socket_path)?;
        info!("Listening on unix://{}", socket_path.display());
        Ok(listener)
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&self, listener: UnixListener) -> InjectorResult<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let this = self.clone();
                        self.inner.connections.spawn(this.handle_connection(stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
        debug!("accept loop stopped");
        Ok(())
    }

    async fn handle_connection(self, stream: UnixStream) {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_LEN));

        loop {
            let line = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = framed.next() => match next {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => {
                        warn!(error = %e, "dropping connection");
                        break;
                    }
                    None => break,
                },
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let reply = match InjectionRequest::parse(line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => Err(e),
            };
            match reply {
                Ok(Some(status)) => {
                    if let Err(e) = framed.send(status.as_str()).await {
                        debug!(error = %e, "client went away");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "dropping connection");
                    break;
                }
            }
        }
    }

    /// Stop accepting, cancel every worker, wait for their completion
    /// callbacks, then remove the socket file.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.inner.shutdown.cancel();

        let canceled = self.inner.registry.cancel_all();
        if canceled > 0 {
            info!(workers = canceled, "canceled running injections");
        }

        self.inner.connections.close();
        self.inner.jobs.close();
        self.inner.connections.wait().await;
        self.inner.jobs.wait().await;

        let socket_path = &self.inner.config.socket_path;
        if socket_path.exists() {
            if let Err(e) = std::fs::remove_file(socket_path) {
                warn!(path = %socket_path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}
