//! Error kinds surfaced by the transport.
//!
//! Every variant is local to a single send/receive call and is returned to
//! the immediate caller. The only retries that happen internally are the
//! byte-level loops inside the control channel, which never surface here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::channel::Direction;

/// Result alias used throughout the transport layer.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport-level error types.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Payload or chunk is larger than the shared region can hold.
    #[error("Payload of {len} bytes exceeds capacity of {capacity} bytes")]
    CapacityExceeded {
        /// Requested length
        len: usize,
        /// Region capacity
        capacity: usize,
    },

    /// Peer ended the session.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// A frame advertised more bytes than the region can supply.
    #[error("Frame advertised {advertised} bytes but the region holds at most {available}")]
    TruncatedRegion {
        /// Length carried by the frame
        advertised: usize,
        /// Bytes the region can supply
        available: usize,
    },

    /// Chunked receive interrupted before the terminator frame.
    #[error("Chunked transfer interrupted after {chunks} chunks ({bytes} bytes discarded)")]
    IncompleteTransfer {
        /// Chunks received before the interruption
        chunks: usize,
        /// Bytes accumulated and then discarded
        bytes: usize,
    },

    /// Two operations in the same direction without the peer taking its turn.
    #[error("Out-of-turn {attempted}: the previous operation was also a {attempted}")]
    OutOfTurn {
        /// The rejected operation
        attempted: Direction,
    },

    /// The receiver acknowledged a different chunk length than was announced.
    #[error("Expected acknowledgment of {expected} bytes, got {received}")]
    UnexpectedAck {
        /// Announced chunk length
        expected: u32,
        /// Length echoed back by the peer
        received: u32,
    },

    /// Length does not fit in a 4-byte frame.
    #[error("Length {0} does not fit in a 4-byte frame")]
    FrameTooLarge(usize),

    /// The backing resource could not be opened or mapped.
    #[error("Failed to open shared region {}: {source}", path.display())]
    RegionOpen {
        /// Backing file or device
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// I/O error on the control channel or the mapping.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// Whether this error means the peer went away, the expected end of a
    /// session loop rather than an application failure.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed | TransportError::IncompleteTransfer { .. }
        )
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        }
    }
}
