//! Chunked transfer of messages larger than the shared region.
//!
//! # Wire Format
//!
//! ```text
//! sender                     receiver
//! write chunk 0, frame(n0) ─►  read n0 bytes
//!                          ◄─  frame(n0)          (acknowledgment)
//! write chunk 1, frame(n1) ─►  read n1 bytes
//!                          ◄─  frame(n1)
//! ...
//! frame(0)                 ─►  done              (terminator, never acked)
//! ```
//!
//! A frame of `0` is reserved for the terminator, so no chunk is ever empty.
//! An empty message is just the terminator on its own.
//!
//! With acknowledgment disabled the receiver stays silent, which matches the
//! legacy wire format but lets the sender overwrite a chunk the receiver has
//! not copied out yet.

use std::num::NonZeroUsize;

use tracing::{debug, warn};

use crate::transport::channel::{Direction, MessageChannel};
use crate::transport::error::{Result, TransportError};
use crate::transport::framing::{frame_length, read_frame, write_frame, TERMINATOR};

/// Default cap on a reassembled message (1 GiB).
pub const DEFAULT_MAX_MESSAGE: usize = 1024 * 1024 * 1024;

/// Splits and reassembles messages in chunks of at most `chunk_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    chunk_size: NonZeroUsize,
    acknowledge: bool,
    max_message: usize,
}

impl Chunker {
    /// Create a chunker, echoing each chunk back when `acknowledge` is set.
    ///
    /// Messages are capped at [`DEFAULT_MAX_MESSAGE`]; see
    /// [`Chunker::with_max_message`].
    pub fn new(chunk_size: NonZeroUsize, acknowledge: bool) -> Self {
        Self {
            chunk_size,
            acknowledge,
            max_message: DEFAULT_MAX_MESSAGE,
        }
    }

    /// Cap the total size of a message sent or reassembled by this chunker.
    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message;
        self
    }

    /// Largest slice written to the region at once.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    /// Whether chunks are acknowledged by the receiver.
    pub fn acknowledges(&self) -> bool {
        self.acknowledge
    }

    /// Largest message this chunker sends or reassembles.
    pub fn max_message(&self) -> usize {
        self.max_message
    }

    /// Number of chunks a payload of `len` bytes is split into.
    pub fn chunk_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size.get())
    }

    /// Transfer `payload` as a sequence of chunks followed by a terminator.
    ///
    /// Counts as a single send for turn-taking purposes.
    ///
    /// # Errors
    ///
    /// - `TransportError::CapacityExceeded` if the chunk size is larger than
    ///   the channel's region, or the payload is larger than the message cap
    ///   (both checked before anything is sent)
    /// - `TransportError::UnexpectedAck` if the receiver acknowledged a
    ///   different length than was announced
    /// - `TransportError::ConnectionClosed` if the receiver went away
    pub async fn send_large(&self, channel: &mut MessageChannel, payload: &[u8]) -> Result<()> {
        channel.begin(Direction::Send)?;

        if self.chunk_size() > channel.capacity() {
            return Err(TransportError::CapacityExceeded {
                len: self.chunk_size(),
                capacity: channel.capacity(),
            });
        }
        if payload.len() > self.max_message {
            return Err(TransportError::CapacityExceeded {
                len: payload.len(),
                capacity: self.max_message,
            });
        }

        for (index, chunk) in payload.chunks(self.chunk_size()).enumerate() {
            channel.write_announce(chunk).await?;

            if self.acknowledge {
                let expected = frame_length(chunk.len())?;
                match read_frame(channel.control_mut()).await? {
                    Some(received) if received == expected => {}
                    Some(received) => {
                        return Err(TransportError::UnexpectedAck { expected, received })
                    }
                    None => return Err(TransportError::ConnectionClosed),
                }
            }
            debug!("Sent chunk {} ({} bytes)", index, chunk.len());
        }

        write_frame(channel.control_mut(), TERMINATOR).await?;
        channel.finish(Direction::Send);

        debug!(
            "Sent {} bytes in {} chunks",
            payload.len(),
            self.chunk_count(payload.len())
        );
        Ok(())
    }

    /// Reassemble a chunked message.
    ///
    /// Returns `Ok(None)` if the peer closed before sending anything. A
    /// close after at least one chunk discards the partial data.
    ///
    /// # Errors
    ///
    /// - `TransportError::IncompleteTransfer` if the peer closed between
    ///   chunks, before the terminator
    /// - `TransportError::TruncatedRegion` if a chunk frame advertises more
    ///   bytes than the region holds
    /// - `TransportError::CapacityExceeded` if the next chunk would grow the
    ///   message past the cap; the rest of the transfer is left unread
    pub async fn receive_large(&self, channel: &mut MessageChannel) -> Result<Option<Vec<u8>>> {
        channel.begin(Direction::Receive)?;

        let mut message = Vec::new();
        let mut chunks = 0usize;

        loop {
            let length = match read_frame(channel.control_mut()).await? {
                Some(length) => length,
                None if chunks == 0 => return Ok(None),
                None => {
                    warn!(
                        "Peer closed mid-transfer after {} chunks; discarding {} bytes",
                        chunks,
                        message.len()
                    );
                    return Err(TransportError::IncompleteTransfer {
                        chunks,
                        bytes: message.len(),
                    });
                }
            };

            if length == TERMINATOR {
                break;
            }

            let total = message.len().saturating_add(length as usize);
            if total > self.max_message {
                warn!(
                    "Chunked message exceeds {} bytes after {} chunks; abandoning transfer",
                    self.max_message, chunks
                );
                return Err(TransportError::CapacityExceeded {
                    len: total,
                    capacity: self.max_message,
                });
            }

            channel.read_announced(length, &mut message)?;
            chunks += 1;

            if self.acknowledge {
                write_frame(channel.control_mut(), length).await?;
            }
        }

        channel.finish(Direction::Receive);
        debug!("Received {} bytes in {} chunks", message.len(), chunks);
        Ok(Some(message))
    }
}
