//! Copy-through-socket transport, the baseline the shared region replaces.
//!
//! # Wire Format
//!
//! ```text
//! length (u32, big-endian) | payload bytes ...
//! ```
//!
//! The payload follows its frame on the stream itself and is written in
//! pieces of at most `buffer_size` bytes. No shared region is involved.

use std::num::NonZeroUsize;

use tracing::debug;

use crate::transport::control::ControlChannel;
use crate::transport::error::{Result, TransportError};
use crate::transport::framing::{frame_length, read_frame, write_frame};

/// Default write/read piece size.
pub const DEFAULT_BUFFER_SIZE: usize = 2 * 1024;

/// Largest inline message accepted, to avoid allocating whatever a broken
/// peer announces.
pub const MAX_INLINE_MESSAGE: usize = 256 * 1024 * 1024;

/// Length-prefixed messages carried entirely over the control stream.
#[derive(Debug)]
pub struct InlineChannel {
    control: ControlChannel,
    buffer_size: NonZeroUsize,
}

impl InlineChannel {
    /// Carry messages over `control`, moving at most `buffer_size` bytes
    /// per socket call.
    pub fn new(control: ControlChannel, buffer_size: NonZeroUsize) -> Self {
        Self {
            control,
            buffer_size,
        }
    }

    /// Release the control stream.
    pub fn into_control(self) -> ControlChannel {
        self.control
    }

    /// Send the frame, then the payload in `buffer_size` pieces.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        check_size(payload.len())?;
        let length = frame_length(payload.len())?;

        write_frame(&mut self.control, length).await?;
        for piece in payload.chunks(self.buffer_size.get()) {
            self.control.send_exact(piece).await?;
        }

        debug!("Sent {} inline bytes to {}", length, self.control.peer());
        Ok(())
    }

    /// Receive one message.
    ///
    /// Returns `Ok(None)` if the peer closed before the frame or before the
    /// whole body arrived; a partial body is never returned.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(length) = read_frame(&mut self.control).await? else {
            return Ok(None);
        };
        let length = length as usize;
        check_size(length)?;

        let mut message = vec![0u8; length];
        for piece in message.chunks_mut(self.buffer_size.get()) {
            if !self.control.recv_into(piece).await? {
                debug!(
                    "Peer {} closed mid-message; dropping partial body",
                    self.control.peer()
                );
                return Ok(None);
            }
        }

        debug!("Received {} inline bytes from {}", length, self.control.peer());
        Ok(Some(message))
    }

    /// Close the write side of the control channel.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.control.shutdown().await
    }
}

fn check_size(len: usize) -> Result<()> {
    if len > MAX_INLINE_MESSAGE {
        return Err(TransportError::CapacityExceeded {
            len,
            capacity: MAX_INLINE_MESSAGE,
        });
    }
    Ok(())
}
