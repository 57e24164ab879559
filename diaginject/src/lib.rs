//! diaginject - ships a diagnostic helper into running containers and runs it.
//!
//! A [`Coordinator`] listens on a Unix socket for `start`, `status` and
//! `stop` requests. A `start` tars the helper directory, streams it into the
//! target container through `pods/exec`, runs the helper script and records
//! whether it succeeded.

pub mod archive;
pub mod artifact;
pub mod client;
pub mod command;
pub mod config;
pub mod exec;
pub mod job;
pub mod pipe;
pub mod registry;
pub mod server;

pub use client::DiagnosticClient;
pub use command::{CommandBuilder, ShellCommandBuilder};
pub use config::CoordinatorConfig;
pub use exec::{ExecConnector, ExecTransport, KubeConnector, StreamSet};
pub use job::{JobHandle, JobLauncher, JobOutcome, JobSpec};
pub use registry::{Admission, WorkerRegistry};
pub use server::{Coordinator, JobReport};

pub use diaginject_shared::{
    Action, InjectionRequest, InjectorError, InjectorResult, PodKey, StatusResponse,
};
