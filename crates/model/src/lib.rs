//! The protocol between the agent loop and chat models.
//!
//! A conversation is a list of [`ModelMessage`]s. The agent sends it to a
//! [`ModelProvider`] together with the [`ModelTool`]s the model may call,
//! and reads back a stream of [`ModelResponseEvent`]s which add up to one
//! assistant message, optionally carrying [`ToolCallRequest`]s.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to. Retrying, tool
//! dispatch and conversation bookkeeping live in the core crate.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
