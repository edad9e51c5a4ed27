//! Shared-memory message transport between a guest and its host.
//!
//! # Architecture
//!
//! Bulk data travels through a memory-mapped region both processes can see;
//! a companion stream socket only carries 4-byte length frames that say when
//! the region holds a complete message and how long it is.
//!
//! ```text
//! ┌─────────────────┐      control stream (frames)     ┌─────────────────┐
//! │   Guest         │  ◄─────────────────────────────► │   Host          │
//! │ (MessageChannel)│    TCP / Unix socket / vsock     │ (MessageChannel)│
//! └────────┬────────┘                                  └────────┬────────┘
//!          │                ┌──────────────────┐                │
//!          └──── mmap ────► │   SharedRegion   │ ◄──── mmap ────┘
//!                           │  (single slot)   │
//!                           └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use khala::transport::{ControlEndpoint, MessageChannel, SharedRegion, TurnPolicy};
//!
//! let region = SharedRegion::open("/dev/khala-shmem", 0, 16 * 1024 * 1024)?;
//! let control = "tcp:10.0.1.2:9000".parse::<ControlEndpoint>()?.connect().await?;
//! let mut channel = MessageChannel::new(region, control, TurnPolicy::Strict);
//!
//! let reply = channel.exchange(b"Hello, world!").await?;
//! ```

mod channel;
mod chunker;
mod control;
mod error;
mod framing;
mod inline;
mod region;

#[cfg(test)]
mod test_support;

pub use channel::{Direction, MessageChannel, SharedMessageChannel, TurnPolicy};
pub use chunker::{Chunker, DEFAULT_MAX_MESSAGE};
pub use control::{ControlChannel, ControlEndpoint, ControlListener, ControlStream, VMADDR_CID_ANY};
pub use error::{Result, TransportError};
pub use framing::{decode_length, encode_length, read_frame, write_frame, FRAME_LEN, TERMINATOR};
pub use inline::{InlineChannel, DEFAULT_BUFFER_SIZE, MAX_INLINE_MESSAGE};
pub use region::SharedRegion;
