//! Single-message send/receive over a shared region and a control channel.
//!
//! # Exchange
//!
//! ```text
//!  sender                                   receiver
//!  ------                                   --------
//!  IDLE                                     IDLE
//!   | region.write(payload)                  |
//!  WRITE_PENDING                             |
//!   | frame(len) ───────────────────────────►|
//!  ANNOUNCED                                LENGTH_RECEIVED
//!   |                                        | region.read(len)
//!  IDLE                                     DATA_READ → IDLE
//! ```
//!
//! The write must complete before the frame is sent, and the receiver must
//! consume the whole frame before touching the region. That handshake is
//! the only mutual exclusion over the region.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::transport::chunker::Chunker;
use crate::transport::control::ControlChannel;
use crate::transport::error::{Result, TransportError};
use crate::transport::framing::{frame_length, read_frame, write_frame};
use crate::transport::region::SharedRegion;

/// Direction of a channel operation, for turn-taking checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Region write plus announcing frame
    Send,
    /// Frame read plus region read
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// How strictly send/receive alternation is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPolicy {
    /// Two operations in the same direction in a row fail with
    /// `TransportError::OutOfTurn`.
    #[default]
    Strict,
    /// No checks. A second send overwrites the region whether or not the
    /// peer has read the first one.
    Relaxed,
}

/// Sends and receives one bounded message at a time.
///
/// Owns the region and the control stream for the lifetime of a session;
/// [`MessageChannel::into_parts`] hands the region back so it can be reused
/// for the next connection.
#[derive(Debug)]
pub struct MessageChannel {
    region: SharedRegion,
    control: ControlChannel,
    policy: TurnPolicy,
    last: Option<Direction>,
}

impl MessageChannel {
    /// Pair a mapped region with a connected control stream.
    ///
    /// Both ends of a session must map the same backing resource at the
    /// same offset and capacity.
    pub fn new(region: SharedRegion, control: ControlChannel, policy: TurnPolicy) -> Self {
        Self {
            region,
            control,
            policy,
            last: None,
        }
    }

    /// Region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// The mapped region.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Turn-taking policy in effect.
    pub fn policy(&self) -> TurnPolicy {
        self.policy
    }

    /// Release the region and the control stream.
    pub fn into_parts(self) -> (SharedRegion, ControlChannel) {
        (self.region, self.control)
    }

    /// Write `payload` into the region, then announce its length.
    ///
    /// # Errors
    ///
    /// - `TransportError::CapacityExceeded` if the payload does not fit
    ///   (nothing is written or sent)
    /// - `TransportError::OutOfTurn` under [`TurnPolicy::Strict`] if the
    ///   previous operation was also a send
    /// - `TransportError::ConnectionClosed` if the peer is gone
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.begin(Direction::Send)?;
        self.write_announce(payload).await?;
        self.finish(Direction::Send);
        Ok(())
    }

    /// Wait for a frame and read the bytes it announces.
    ///
    /// Returns `Ok(None)` if the peer closed the control channel before a
    /// whole frame arrived, the normal end of a session.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::TruncatedRegion` if the frame advertises more
    /// bytes than the region holds.
    pub async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        self.begin(Direction::Receive)?;

        let Some(length) = read_frame(&mut self.control).await? else {
            return Ok(None);
        };

        // Sized by the region read, once the length has been checked.
        let mut message = Vec::new();
        self.read_announced(length, &mut message)?;
        self.finish(Direction::Receive);

        debug!("Received {} bytes from {}", length, self.control.peer());
        Ok(Some(message))
    }

    /// Send `request` and wait for the reply.
    pub async fn exchange(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.send(request).await?;
        self.receive().await
    }

    /// Close the write side of the control channel.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.control.shutdown().await
    }

    pub(crate) fn begin(&self, direction: Direction) -> Result<()> {
        if self.policy == TurnPolicy::Strict && self.last == Some(direction) {
            return Err(TransportError::OutOfTurn {
                attempted: direction,
            });
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self, direction: Direction) {
        self.last = Some(direction);
    }

    /// Region write followed by its announcing frame, without turn checks.
    pub(crate) async fn write_announce(&mut self, payload: &[u8]) -> Result<()> {
        let length = frame_length(payload.len())?;
        self.region.write(payload)?;
        write_frame(&mut self.control, length).await?;
        debug!("Announced {} bytes to {}", length, self.control.peer());
        Ok(())
    }

    /// Append `length` announced bytes from the region to `out`.
    ///
    /// The length is checked against the region before `out` grows.
    pub(crate) fn read_announced(&self, length: u32, out: &mut Vec<u8>) -> Result<()> {
        let advertised = length as usize;
        if advertised > self.region.capacity() {
            return Err(TransportError::TruncatedRegion {
                advertised,
                available: self.region.capacity(),
            });
        }
        self.region.read_into(advertised, out)
    }

    pub(crate) fn control_mut(&mut self) -> &mut ControlChannel {
        &mut self.control
    }
}

/// A `MessageChannel` shared between tasks.
///
/// Each operation holds the lock for its whole cycle, so a send is never
/// interleaved with another task's send, and an `exchange` keeps the reply
/// paired with its request.
#[derive(Debug, Clone)]
pub struct SharedMessageChannel {
    inner: Arc<Mutex<MessageChannel>>,
}

impl SharedMessageChannel {
    /// Wrap `channel` for use from several tasks.
    pub fn new(channel: MessageChannel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    /// Lock the channel and [`MessageChannel::send`] `payload`.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.inner.lock().await.send(payload).await
    }

    /// Lock the channel for a whole chunked transfer of `payload`.
    pub async fn send_large(&self, chunker: &Chunker, payload: &[u8]) -> Result<()> {
        let mut channel = self.inner.lock().await;
        chunker.send_large(&mut channel, payload).await
    }

    /// Lock the channel and wait for the next message.
    pub async fn receive(&self) -> Result<Option<Vec<u8>>> {
        self.inner.lock().await.receive().await
    }

    /// Send `request` and receive its reply under a single lock.
    pub async fn exchange(&self, request: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.lock().await.exchange(request).await
    }

    /// Recover the channel once every other clone has been dropped.
    pub fn try_unwrap(self) -> std::result::Result<MessageChannel, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}
