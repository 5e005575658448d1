//! ftplite: a minimal file-transfer protocol
//!
//! A persistent control connection carries length-prefixed commands and
//! replies; each `get`/`put` moves its bytes over a short-lived data
//! connection that the server listens for and the client opens.

pub mod cli;
pub mod client;
pub mod command;
pub mod data_channel;
pub mod error;
pub mod framing;
pub mod fs_enum;
pub mod log;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;
pub mod worker;

pub use client::Client;
pub use error::{Error, Result};
pub use protocol::PortReply;
pub use server::{ServeMode, Server, ServerConfig, ServerHandle};
