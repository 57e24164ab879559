//! Client for the IPC endpoint.

use diaginject_shared::constants::{helper, ipc::MAX_REQUEST_LEN};
use diaginject_shared::{
    Action, InjectionRequest, InjectorError, InjectorResult, PodKey, StatusResponse,
};
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

/// One connection to the coordinator; one request/reply exchange at a time.
///
/// Without a connection every poll answers [`StatusResponse::Closed`]
/// without touching the network.
pub struct DiagnosticClient {
    conn: Option<Framed<UnixStream, LinesCodec>>,
    tool: String,
}

impl Default for DiagnosticClient {
    fn default() -> Self {
        Self {
            conn: None,
            tool: helper::DEFAULT_TOOL.to_string(),
        }
    }
}

impl DiagnosticClient {
    /// A client with no connection.
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub async fn connect(path: impl AsRef<Path>) -> InjectorResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        Ok(Self {
            conn: Some(Framed::new(
                stream,
                LinesCodec::new_with_max_length(MAX_REQUEST_LEN),
            )),
            ..Self::default()
        })
    }

    /// Send requests with a tool name other than the default.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Send one request and read its reply.
    ///
    /// `stop` has no reply and returns [`StatusResponse::Idle`] once sent. A
    /// connection that closes before replying is dropped and reported as
    /// [`StatusResponse::Closed`].
    ///
    /// # Errors
    ///
    /// `MalformedRequest` if a field cannot be put on the wire, `Io` if the
    /// socket fails.
    pub async fn poll(
        &mut self,
        action: Action,
        key: &PodKey,
        attrs: &str,
    ) -> InjectorResult<StatusResponse> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(StatusResponse::Closed);
        };

        let line = InjectionRequest::new(action, key.clone(), self.tool.clone(), attrs).encode()?;
        if let Err(e) = conn.send(line).await {
            self.conn = None;
            return Err(codec_error(e));
        }
        if !action.expects_reply() {
            return Ok(StatusResponse::Idle);
        }

        match conn.next().await {
            Some(Ok(reply)) => Ok(StatusResponse::from_token(&reply)),
            Some(Err(e)) => {
                self.conn = None;
                Err(codec_error(e))
            }
            None => {
                debug!(pod = %key, "connection closed before reply");
                self.conn = None;
                Ok(StatusResponse::Closed)
            }
        }
    }

    /// Poll `status` every `interval` until the pod is no longer `writing...`.
    pub async fn wait_until_settled(
        &mut self,
        key: &PodKey,
        interval: Duration,
    ) -> InjectorResult<StatusResponse> {
        loop {
            let status = self.poll(Action::Status, key, "").await?;
            if status != StatusResponse::Writing {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Drop the connection. Later polls answer `closed...`.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = SinkExt::<String>::close(&mut conn).await {
                debug!(error = %e, "error closing connection");
            }
        }
    }
}

fn codec_error(e: LinesCodecError) -> InjectorError {
    match e {
        LinesCodecError::Io(e) => InjectorError::Io(e),
        other => InjectorError::StreamFailed(other.to_string()),
    }
}
