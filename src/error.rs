//! # Error Types
//!
//! Crate-wide error taxonomy. Failures local to one peer or one piece are
//! recovered by the scheduler (the piece is retried on another worker);
//! everything surfaced here means a whole command failed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed bencode input, with the byte offset of the problem.
    #[error("invalid bencode at offset {offset}: {reason}")]
    Bencode { offset: usize, reason: String },

    /// Structural problem in a metainfo file.
    #[error("invalid torrent: {0}")]
    InvalidTorrent(String),

    /// Structural problem in a magnet URI.
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    /// Tracker unreachable, non-success status, unparseable response,
    /// or an explicit `failure reason` from the tracker.
    #[error("tracker failure: {0}")]
    Tracker(String),

    /// Tracker answered but returned zero peer addresses.
    #[error("tracker returned no peers")]
    NoPeers,

    /// Handshake, framing or message-level violation fatal to a connection.
    #[error("peer protocol: {0}")]
    PeerProtocol(String),

    /// A downloaded piece or the fetched metadata failed SHA-1 verification.
    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    /// All peers exhausted while pieces were still pending.
    #[error("download incomplete: {0}")]
    DownloadIncomplete(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for bencode errors, used by the decoder.
    pub(crate) fn bencode(offset: usize, reason: impl Into<String>) -> Error {
        Error::Bencode {
            offset,
            reason: reason.into(),
        }
    }
}
