//! Shared domain types for the wuhu session engine.
//!
//! Everything here is plain data: the transcript entry model, queue lanes,
//! provider stream events, tool types, and server configuration. No I/O.

pub mod config;
pub mod entry;
pub mod error;
pub mod queue;
pub mod session;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
