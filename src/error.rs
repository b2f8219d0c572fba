use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Malformed bencode, wire frame or torrent metadata
    #[error("format error: {0}")]
    FormatError(String),

    /// The remote peer broke the protocol (bad handshake, oversized frame)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),

    /// A fully retrieved piece did not match its expected hash
    #[error("piece {0} failed hash verification")]
    IntegrityError(usize),

    #[error("tracker error: {0}")]
    TrackerError(String),

    #[error("storage error: {0}")]
    StorageError(#[source] io::Error),

    #[error("worker error: {0}")]
    WorkerError(String),
}

impl ApplicationError {
    /// Errors that only concern the peer they happened on. The worker that
    /// hit one drops that peer and moves on to the next address.
    pub fn is_peer_local(&self) -> bool {
        matches!(
            self,
            ApplicationError::FormatError(_)
                | ApplicationError::ProtocolError(_)
                | ApplicationError::TransportError(_)
        )
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        ApplicationError::TransportError(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}
