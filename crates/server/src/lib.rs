//! The wuhu server: session actors, the agent loop, the subscription hub,
//! runner links, and the HTTP API.

pub mod api;
pub mod cli;
pub mod environment;
pub mod executor;
pub mod hub;
pub mod runners;
pub mod session;
pub mod state;

/// System prompt used when a session is created without one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding agent operating in a persistent \
session. You have tools for reading, writing, editing, and searching files, and for running \
shell commands. Work step by step, inspect before you modify, and report what you changed.";
