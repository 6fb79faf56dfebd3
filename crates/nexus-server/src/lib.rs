//! # nexus-server
//!
//! Multi-user TCP chat server: framed binary protocol, chat rooms, chunked
//! file uploads, and a plaintext admin channel.

pub mod admin;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod pool;
pub mod registry;
pub mod room;
pub mod session;
pub mod stats;
pub mod traffic;
pub mod transfer;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use context::ServerContext;
pub use engine::{EngineState, Server};
pub use error::ServerError;
