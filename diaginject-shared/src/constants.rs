//! Shared constants between the coordinator and its clients
//!
//! These values form the contract on both sides of the local socket and
//! inside the target container.

/// IPC endpoint constants
pub mod ipc {
    /// Default filesystem path of the coordinator socket.
    pub const DEFAULT_SOCKET_PATH: &str = "/tmp/operator.sock";

    /// Requests longer than this (newline excluded) are rejected.
    pub const MAX_REQUEST_LEN: usize = 1024;

    /// Separator between request fields.
    pub const FIELD_SEPARATOR: char = ':';

    /// Number of fields in a request line.
    pub const REQUEST_FIELDS: usize = 5;
}

/// Worker limits
pub mod workers {
    /// Default number of injections allowed to run at once.
    pub const DEFAULT_MAX_WORKERS: usize = 1;
}

/// Helper payload and in-container contract
pub mod helper {
    /// The only tool currently shipped.
    pub const DEFAULT_TOOL: &str = "linperf";

    /// Default host directory holding the helper scripts.
    pub const DEFAULT_SRC_DIR: &str = "/helpers";

    /// Default extraction target inside the container.
    pub const DEFAULT_DEST_DIR: &str = "/tmp/diaginject/helpers";

    /// Parent directory every artifact path starts with.
    pub const ARTIFACT_PREFIX: &str = "/serviceability";

    /// Suffix every artifact path ends with.
    pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

    /// Shell used to run the helper command.
    pub const SHELL: &str = "/bin/sh";
}
