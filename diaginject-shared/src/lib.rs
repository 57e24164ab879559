//! diaginject shared - code common to the coordinator and its clients
//!
//! This crate contains the socket protocol, the constants both sides of the
//! socket (and the helper inside the container) agree on, and the error
//! type.

pub mod constants;
pub mod errors;
pub mod protocol;

pub use errors::{InjectorError, InjectorResult};
pub use protocol::{Action, InjectionRequest, PodKey, StatusResponse};
