//! Shared protocol constants for the ftplite control and data channels

use crate::error::{Error, Result};

// Every message starts with a zero-padded decimal length of this many digits
pub const HEADER_WIDTH: usize = 10;

// Largest payload the header can describe (10^10 - 1)
pub const MAX_MESSAGE_LEN: u64 = 9_999_999_999;

// Reply sent in place of a port when a `get` names a file that cannot be served
pub const NOT_FOUND_SENTINEL: &str = "-1";

pub mod verb {
    pub const GET: &str = "get";
    pub const PUT: &str = "put";
    pub const LS: &str = "ls";
    pub const QUIT: &str = "quit";
    // Client-local verbs, never sent over the wire
    pub const LLS: &str = "lls";
    pub const HELP: &str = "help";
}

pub const HELP: &str = "The FTP client accepts the following commands:
\tget <file name> - downloads file <file name> from the server
\tput <file name> - uploads file <file name> to the server
\tls - lists files on the server
\tlls - lists files on the client
\tquit - disconnects and exits";

/// Answer to a `get` or `put` negotiation: where to open the data channel,
/// or that there is nothing to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReply {
    Port(u16),
    NotFound,
}

impl PortReply {
    pub fn encode(&self) -> String {
        match self {
            PortReply::Port(p) => p.to_string(),
            PortReply::NotFound => NOT_FOUND_SENTINEL.to_string(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::UnexpectedReply(String::from_utf8_lossy(payload).into_owned()))?
            .trim();
        if text == NOT_FOUND_SENTINEL {
            return Ok(PortReply::NotFound);
        }
        match text.parse::<u16>() {
            Ok(p) if p != 0 => Ok(PortReply::Port(p)),
            _ => Err(Error::UnexpectedReply(text.to_string())),
        }
    }
}
