//! Exec transport.
//!
//! Runs a command inside a named container with caller-supplied stdio and
//! a cancellation token.
//!
//! ## Architecture
//!
//! - **Transport Layer** (mod.rs): [`ExecTransport`] / [`ExecConnector`] traits
//! - **Cluster Layer** (cluster.rs): `pods/exec` over the API server websocket
//! - **Output Layer** (output.rs): capture buffers and log sinks for remote output
//!
//! The job layer only sees the traits, so tests swap in a scripted transport.

mod cluster;
mod output;

pub use cluster::{KubeConnector, KubeExecTransport};
pub use output::{CaptureBuffer, DiagnosticSink, LogLevel};

use async_trait::async_trait;
use diaginject_shared::{InjectorResult, PodKey};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Boxed local source for remote stdin.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed local destination for remote stdout/stderr.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local streams attached to one exec call.
///
/// A missing stdin means the remote process gets none; missing stdout or
/// stderr are drained and discarded.
#[derive(Default)]
pub struct StreamSet {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }
}

/// Runs commands in containers.
#[async_trait]
pub trait ExecTransport: Send + Sync {
    /// Run `command` in `target` and block until it exits.
    ///
    /// Output is written to the attached streams as it arrives. Local EOF
    /// on stdin closes the remote input. Cancelling `cancel` tears the
    /// channel down and returns [`InjectorError::Canceled`](diaginject_shared::InjectorError::Canceled).
    ///
    /// # Errors
    ///
    /// - `ConnectFailed`: the channel could not be opened
    /// - `StreamFailed`: the channel broke mid-stream
    /// - `Canceled`: `cancel` fired
    /// - `RemoteExitNonZero`: the process exited unsuccessfully
    async fn run(
        &self,
        target: &PodKey,
        command: Vec<String>,
        streams: StreamSet,
        cancel: CancellationToken,
    ) -> InjectorResult<()>;
}

/// Produces transports; failure here is `ClientBuildFailed`.
#[async_trait]
pub trait ExecConnector: Send + Sync {
    async fn connect(&self) -> InjectorResult<Arc<dyn ExecTransport>>;
}
