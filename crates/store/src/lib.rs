//! Durable state for the wuhu engine: the append-only transcript and the
//! three journaled queue lanes, over a single SQLite database.
//!
//! The transcript is the truth: status, LLM context, and the queue pending
//! set are all derivable from the log. Every append commits synchronously
//! before the operation returns.

mod db;
mod queue;
mod recovery;
mod transcript;

pub use db::Database;
pub use queue::QueueStore;
pub use recovery::reconcile_session;
pub use transcript::{NewSession, TranscriptStore};
