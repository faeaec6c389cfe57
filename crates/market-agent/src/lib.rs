//! A financial trading assistant built on the market agent loop.
//!
//! The crate assembles the tools, prompts and model provider into a
//! [`Session`], and includes a CLI for chatting with it in the terminal.
//! It can also be used as a library to embed the assistant elsewhere.

#[macro_use]
extern crate tracing;

pub mod config;
mod error;
pub mod prompt;
mod session;
pub mod tools;
pub mod usage;

pub use error::{ConfigError, Error, UsageError};
pub use session::{Session, SessionBuilder};

/// Re-exports of [`market_agent_core`] crate.
pub mod core {
    pub use market_agent_core::*;
}
