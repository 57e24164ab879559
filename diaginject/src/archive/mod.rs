//! Archive helpers.
//!
//! The `tar` module packages the helper directory into the stream the
//! remote `tar -xf -` consumes.

mod tar;

pub use self::tar::{extraction_parent, spawn_producer, write_tar};
