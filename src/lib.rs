//! EdgeOne AI Gateway pipe.
//!
//! Forwards chat requests from a chat host to a Gemini-compatible
//! gateway, spreading load over several API keys and benching keys
//! that keep failing.

pub mod adapters;
pub mod config;
pub mod error;
pub mod pipe;
pub mod pool;
pub mod server;

pub use config::{PipeConfig, PIPE_ID};
pub use error::PipeError;
pub use pipe::Pipe;
pub use pool::{CooldownPolicy, KeyRotator, KeySelection};
