//! Error types for imap-source

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A protocol operation exceeded its wall-clock deadline.
    #[error("operation timed out")]
    TimedOut,

    /// A protocol command failed or the server reply was malformed.
    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    /// The shared connection has been quit or torn down; reopen to recover.
    #[error("connection is dead")]
    Dead,

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The addressed message key does not exist on the server.
    #[error("no such message: {0}")]
    NotFound(String),

    /// The folder's UIDVALIDITY changed; every previously emitted key for
    /// the folder is stale.
    #[error("mailbox is out of sync: {0}")]
    OutOfSync(String),

    #[error("message parsing error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the connection-class failures that warrant recycling the
    /// shared connection instead of surfacing them to the caller.
    #[must_use]
    pub fn is_conn_error(&self) -> bool {
        matches!(
            self,
            Self::TimedOut | Self::Protocol(_) | Self::Io(_) | Self::Tls(_) | Self::Dead
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
