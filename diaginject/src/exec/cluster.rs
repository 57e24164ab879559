//! `pods/exec` through the Kubernetes API server.

use super::{BoxedReader, BoxedWriter, ExecConnector, ExecTransport, StreamSet};
use async_trait::async_trait;
use diaginject_shared::{InjectorError, InjectorResult, PodKey};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::Client;
use kube::api::{Api, AttachParams};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connect timeout for the API server; exec calls themselves never time out.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Status reported by the API server when the command succeeded.
const STATUS_SUCCESS: &str = "Success";

/// Cause reason carrying the remote exit code.
const CAUSE_EXIT_CODE: &str = "ExitCode";

/// Builds a [`KubeExecTransport`] from the inferred kube config.
///
/// In-cluster service account credentials are preferred, then the local
/// kubeconfig. The client is built on first use and shared afterwards; a
/// failed build is retried on the next call.
#[derive(Default)]
pub struct KubeConnector {
    client: OnceCell<Client>,
}

impl KubeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already built client.
    pub fn from_client(client: Client) -> Self {
        Self {
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn build_client() -> InjectorResult<Client> {
        let mut config = kube::Config::infer()
            .await
            .map_err(|e| InjectorError::ClientBuildFailed(e.to_string()))?;
        config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        config.read_timeout = None;

        let client =
            Client::try_from(config).map_err(|e| InjectorError::ClientBuildFailed(e.to_string()))?;
        info!("Kubernetes client ready");
        Ok(client)
    }
}

#[async_trait]
impl ExecConnector for KubeConnector {
    async fn connect(&self) -> InjectorResult<Arc<dyn ExecTransport>> {
        let client = self.client.get_or_try_init(Self::build_client).await?;
        Ok(Arc::new(KubeExecTransport::new(client.clone())))
    }
}

/// Exec transport over the API server websocket.
#[derive(Clone)]
pub struct KubeExecTransport {
    client: Client,
}

impl KubeExecTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecTransport for KubeExecTransport {
    async fn run(
        &self,
        target: &PodKey,
        command: Vec<String>,
        streams: StreamSet,
        cancel: CancellationToken,
    ) -> InjectorResult<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        let mut params = AttachParams::default()
            .stdin(streams.stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = target.container() {
            params = params.container(container);
        }

        debug!(pod = %target, command = ?command, "opening exec channel");
        let mut attached = tokio::select! {
            _ = cancel.cancelled() => return Err(InjectorError::Canceled),
            res = pods.exec(&target.name, command, &params) => res.map_err(|e| {
                InjectorError::ConnectFailed(format!("{}: {}", target, e))
            })?,
        };

        let status = attached.take_status();
        let remote_stdin = attached.stdin();
        let remote_stdout = attached.stdout();
        let remote_stderr = attached.stderr();
        let StreamSet {
            stdin,
            stdout,
            stderr,
        } = streams;

        let pumps = async move {
            tokio::try_join!(
                pump_stdin(stdin, remote_stdin),
                pump_output(remote_stdout, stdout),
                pump_output(remote_stderr, stderr),
            )
        };

        let pumped = tokio::select! {
            _ = cancel.cancelled() => {
                attached.abort();
                return Err(InjectorError::Canceled);
            }
            res = pumps => res,
        };
        if let Err(e) = pumped {
            attached.abort();
            return Err(InjectorError::StreamFailed(format!("{}: {}", target, e)));
        }

        let status = match status {
            Some(status) => tokio::select! {
                _ = cancel.cancelled() => {
                    attached.abort();
                    return Err(InjectorError::Canceled);
                }
                status = status => status,
            },
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|e| InjectorError::StreamFailed(format!("{}: {}", target, e)))?;

        check_status(status)
    }
}

/// Copy local stdin to the remote process, then close the remote input.
///
/// A remote that exits before reading everything is not a stream failure;
/// its exit status decides the outcome.
async fn pump_stdin<W>(local: Option<BoxedReader>, remote: Option<W>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let (Some(mut local), Some(mut remote)) = (local, remote) else {
        return Ok(());
    };

    let copied = tokio::io::copy(&mut local, &mut remote).await;
    let closed = remote.shutdown().await;
    match (copied, closed) {
        (Ok(bytes), _) => debug!(bytes, "stdin forwarded"),
        (Err(e), _) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!(error = %e, "remote stdin closed early")
        }
        (Err(e), _) => return Err(e),
    }
    Ok(())
}

/// Copy remote output to the local writer, or drain it when there is none.
async fn pump_output<R>(remote: Option<R>, local: Option<BoxedWriter>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut remote) = remote else {
        return Ok(());
    };

    match local {
        Some(mut local) => {
            tokio::io::copy(&mut remote, &mut local).await?;
            local.shutdown().await?;
        }
        None => {
            tokio::io::copy(&mut remote, &mut tokio::io::sink()).await?;
        }
    }
    Ok(())
}

/// Map the API server's final status to a result.
fn check_status(status: Option<Status>) -> InjectorResult<()> {
    let Some(status) = status else {
        return Err(InjectorError::StreamFailed(
            "exec channel closed without a status".into(),
        ));
    };

    if status.status.as_deref() == Some(STATUS_SUCCESS) {
        return Ok(());
    }

    Err(InjectorError::RemoteExitNonZero {
        code: exit_code(&status).unwrap_or(-1),
        message: status
            .message
            .or(status.reason)
            .unwrap_or_else(|| "remote command failed".to_string()),
    })
}

fn exit_code(status: &Status) -> Option<i32> {
    status
        .details
        .as_ref()?
        .causes
        .as_ref()?
        .iter()
        .find(|cause| cause.reason.as_deref() == Some(CAUSE_EXIT_CODE))?
        .message
        .as_deref()?
        .parse()
        .ok()
}
