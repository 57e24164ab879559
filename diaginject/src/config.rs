//! Configuration for the coordinator.

use diaginject_shared::constants::{helper, ipc, workers};
use diaginject_shared::{InjectorError, InjectorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default byte capacity of the tar pipe.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Coordinator settings.
///
/// Every field has a default, so a JSON file only needs the values that
/// differ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Filesystem path of the IPC socket.
    ///
    /// Default: /tmp/operator.sock
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Maximum number of injections running at once.
    ///
    /// Default: 1
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Host directory shipped into the container.
    #[serde(default = "default_helper_src_dir")]
    pub helper_src_dir: PathBuf,

    /// Where the helper directory lands inside the container. Must be
    /// absolute and not `/`.
    #[serde(default = "default_helper_dest_dir")]
    pub helper_dest_dir: PathBuf,

    /// Container to exec into when a request does not name one.
    /// Empty selects the pod's default container.
    #[serde(default)]
    pub default_container: String,

    /// Helper every `start` runs (`<helper_dest>/<tool>.sh`). The request's
    /// tool field is reserved and not checked against it.
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Buffer size of the tar pipe in bytes.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(ipc::DEFAULT_SOCKET_PATH)
}

fn default_max_workers() -> usize {
    workers::DEFAULT_MAX_WORKERS
}

fn default_helper_src_dir() -> PathBuf {
    PathBuf::from(helper::DEFAULT_SRC_DIR)
}

fn default_helper_dest_dir() -> PathBuf {
    PathBuf::from(helper::DEFAULT_DEST_DIR)
}

fn default_tool() -> String {
    helper::DEFAULT_TOOL.to_string()
}

fn default_pipe_capacity() -> usize {
    DEFAULT_PIPE_CAPACITY
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            max_workers: default_max_workers(),
            helper_src_dir: default_helper_src_dir(),
            helper_dest_dir: default_helper_dest_dir(),
            default_container: String::new(),
            tool: default_tool(),
            pipe_capacity: default_pipe_capacity(),
        }
    }
}

impl CoordinatorConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> InjectorResult<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            InjectorError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the coordinator relies on.
    pub fn validate(&self) -> InjectorResult<()> {
        if self.max_workers == 0 {
            return Err(InjectorError::Config("max_workers must be at least 1".into()));
        }
        if self.pipe_capacity == 0 {
            return Err(InjectorError::Config("pipe_capacity must be positive".into()));
        }
        if !self.helper_dest_dir.is_absolute() || self.helper_dest_dir.parent().is_none() {
            return Err(InjectorError::Config(format!(
                "helper_dest_dir must be an absolute path below /, got {}",
                self.helper_dest_dir.display()
            )));
        }
        if self.tool.is_empty() || self.tool.contains(ipc::FIELD_SEPARATOR) {
            return Err(InjectorError::Config(format!(
                "tool name '{}' is not usable on the wire",
                self.tool
            )));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(InjectorError::Config("socket_path is empty".into()));
        }
        Ok(())
    }
}
