//! Error types for framing, negotiation and transfers

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Peer closed the stream (a zero-length read or write) before the
    /// message was complete. `partial` holds whatever was read so far.
    #[error("socket connection broken after {transferred} bytes")]
    ConnectionBroken { transferred: u64, partial: Vec<u8> },

    /// Transport failed mid-message. Handled exactly like `ConnectionBroken`.
    #[error("socket connection failed after {transferred} bytes: {source}")]
    Transport {
        transferred: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("FTP protocol does not match, unable to receive data (header {:?})", String::from_utf8_lossy(.header))]
    ProtocolMismatch { header: Vec<u8> },

    #[error("message of {len} bytes does not fit in the length header")]
    MessageTooLarge { len: u64 },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("'{}' is not a valid file", .0.display())]
    FileNotFound(PathBuf),

    #[error("can not write to {}: {source}", .path.display())]
    FileUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' is not a valid file on the server")]
    RemoteNotFound(String),

    #[error("unexpected reply from peer: {0:?}")]
    UnexpectedReply(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors after which the control connection can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionBroken { .. }
                | Error::Transport { .. }
                | Error::ProtocolMismatch { .. }
                | Error::UnexpectedReply(_)
                | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
