//! Error type shared by the coordinator, its transport and its clients.

use thiserror::Error;

/// Result alias used across the workspace.
pub type InjectorResult<T> = Result<T, InjectorError>;

/// Every failure the coordinator can observe.
///
/// Only the protocol-level kinds (`MalformedRequest`, `Saturated`,
/// `Duplicate`) ever influence what a client sees, and then only as a
/// status token. The rest travel through completion callbacks and logs.
#[derive(Debug, Error)]
pub enum InjectorError {
    /// The cluster client could not be constructed (no kubeconfig, bad
    /// in-cluster credentials, ...).
    #[error("failed to build cluster client: {0}")]
    ClientBuildFailed(String),

    /// The exec channel could not be opened.
    #[error("failed to open exec channel: {0}")]
    ConnectFailed(String),

    /// The exec channel broke while streaming.
    #[error("exec stream failed: {0}")]
    StreamFailed(String),

    /// The operation was aborted through its cancellation token.
    #[error("operation canceled")]
    Canceled,

    /// The remote process exited with a non-zero status.
    #[error("remote process exited with code {code}: {message}")]
    RemoteExitNonZero { code: i32, message: String },

    /// A request line did not have the expected shape.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The worker cap was reached.
    #[error("worker limit reached")]
    Saturated,

    /// A worker already exists for the pod.
    #[error("worker already running for pod {0}")]
    Duplicate(String),

    /// Building the helper archive failed.
    #[error("archive error: {0}")]
    Archive(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl InjectorError {
    /// True for the cancellation outcome.
    pub fn is_canceled(&self) -> bool {
        matches!(self, InjectorError::Canceled)
    }
}

impl From<serde_json::Error> for InjectorError {
    fn from(err: serde_json::Error) -> Self {
        InjectorError::Config(err.to_string())
    }
}
