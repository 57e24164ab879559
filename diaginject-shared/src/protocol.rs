//! Line protocol spoken over the coordinator socket.
//!
//! A request is one line of five colon-separated fields:
//!
//! ```text
//! podName:podNamespace:tool:action:encodedAttr
//! ```
//!
//! and every reply is one status token on its own line.

use crate::constants::ipc::{FIELD_SEPARATOR, MAX_REQUEST_LEN, REQUEST_FIELDS};
use crate::errors::{InjectorError, InjectorResult};
use serde::{Deserialize, Serialize};

/// Identity of a target container.
///
/// The pod name alone keys the worker registry; namespace and container
/// travel with the job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub name: String,
    pub namespace: String,
    /// Empty means the pod's default container.
    #[serde(default)]
    pub container: String,
}

impl PodKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            container: String::new(),
        }
    }

    /// Target a specific container.
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    /// Container name for the exec call, if one was set.
    pub fn container(&self) -> Option<&str> {
        if self.container.is_empty() {
            None
        } else {
            Some(&self.container)
        }
    }
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)?;
        if !self.container.is_empty() {
            write!(f, "[{}]", self.container)?;
        }
        Ok(())
    }
}

/// What a request asks the coordinator to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Start,
    Status,
    Stop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Status => "status",
            Action::Stop => "stop",
        }
    }

    /// Whether the coordinator answers this action.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, Action::Stop)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = InjectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "status" => Ok(Action::Status),
            "stop" => Ok(Action::Stop),
            other => Err(InjectorError::MalformedRequest(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }
}

/// One decoded request line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectionRequest {
    pub key: PodKey,
    pub tool: String,
    pub action: Action,
    /// Opaque to everything but the command builder.
    pub encoded_attrs: String,
}

impl InjectionRequest {
    pub fn new(
        action: Action,
        key: PodKey,
        tool: impl Into<String>,
        encoded_attrs: impl Into<String>,
    ) -> Self {
        Self {
            key,
            tool: tool.into(),
            action,
            encoded_attrs: encoded_attrs.into(),
        }
    }

    /// Parse one line (without its terminating newline).
    ///
    /// Exactly five fields are required and the pod name must be present;
    /// anything else is `MalformedRequest`.
    pub fn parse(line: &str) -> InjectorResult<Self> {
        let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if fields.len() != REQUEST_FIELDS {
            return Err(InjectorError::MalformedRequest(format!(
                "expected {} fields, got {}",
                REQUEST_FIELDS,
                fields.len()
            )));
        }
        if fields[0].is_empty() {
            return Err(InjectorError::MalformedRequest("empty pod name".into()));
        }

        Ok(Self {
            key: PodKey::new(fields[0], fields[1]),
            tool: fields[2].to_string(),
            action: fields[3].parse()?,
            encoded_attrs: fields[4].to_string(),
        })
    }

    /// Render the request as a line, without the trailing newline.
    pub fn encode(&self) -> InjectorResult<String> {
        let fields = [
            self.key.name.as_str(),
            self.key.namespace.as_str(),
            self.tool.as_str(),
            self.action.as_str(),
            self.encoded_attrs.as_str(),
        ];
        if let Some(bad) = fields
            .iter()
            .find(|f| f.contains(FIELD_SEPARATOR) || f.contains('\n'))
        {
            return Err(InjectorError::MalformedRequest(format!(
                "field '{}' contains a separator",
                bad
            )));
        }

        let line = fields.join(":");
        if line.len() > MAX_REQUEST_LEN {
            return Err(InjectorError::MalformedRequest(format!(
                "request is {} bytes, limit is {}",
                line.len(),
                MAX_REQUEST_LEN
            )));
        }
        Ok(line)
    }
}

/// The reply tokens the protocol knows about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusResponse {
    /// A worker is running for the pod (or was just admitted).
    Writing,
    /// Nothing is running and the last run did not succeed (or never ran).
    Idle,
    /// The last run for the pod succeeded.
    Done,
    /// Client side only: there is no connection to ask on.
    Closed,
    /// The worker cap rejected the start.
    TooManyWorkers,
    /// A token this build does not know, passed through verbatim.
    Other(String),
}

impl StatusResponse {
    pub fn as_str(&self) -> &str {
        match self {
            StatusResponse::Writing => "writing...",
            StatusResponse::Idle => "idle...",
            StatusResponse::Done => "done...",
            StatusResponse::Closed => "closed...",
            StatusResponse::TooManyWorkers => "toomanyworkers...",
            StatusResponse::Other(token) => token,
        }
    }

    /// Decode a reply line. Never fails; unknown tokens become `Other`.
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "writing..." => StatusResponse::Writing,
            "idle..." => StatusResponse::Idle,
            "done..." => StatusResponse::Done,
            "closed..." => StatusResponse::Closed,
            "toomanyworkers..." => StatusResponse::TooManyWorkers,
            other => StatusResponse::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for StatusResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
