//! # rda-common
//!
//! Shared error types, configuration, and logging setup for the remote
//! desktop streaming agent core.

pub mod config;
pub mod error;
pub mod logging;

pub use config::AgentConfig;
pub use error::{AdaptiveError, AppResult, CaptureError, EncodeError, SessionError};
