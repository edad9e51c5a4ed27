//! Fixtures shared by the transport unit tests.
//!
//! Two `SharedRegion`s mapped over one temporary file stand in for the guest
//! and host mappings of the same backing device.

use tempfile::NamedTempFile;
use tokio::net::UnixStream;

use crate::transport::channel::{MessageChannel, TurnPolicy};
use crate::transport::control::ControlChannel;
use crate::transport::region::SharedRegion;

/// Create a zero-filled backing file of `len` bytes.
pub(crate) fn backing_file(len: u64) -> NamedTempFile {
    let file = NamedTempFile::new().expect("Failed to create backing file");
    file.as_file()
        .set_len(len)
        .expect("Failed to size backing file");
    file
}

pub(crate) struct RegionPair {
    pub file: NamedTempFile,
    pub writer: SharedRegion,
    pub reader: SharedRegion,
}

/// Two mappings of the same `capacity`-byte backing file.
pub(crate) fn region_pair(capacity: usize) -> RegionPair {
    let file = backing_file(capacity as u64);
    let writer = SharedRegion::open(file.path(), 0, capacity).expect("Failed to map writer");
    let reader = SharedRegion::open(file.path(), 0, capacity).expect("Failed to map reader");
    RegionPair {
        file,
        writer,
        reader,
    }
}

pub(crate) struct ChannelPair {
    pub file: NamedTempFile,
    pub left: MessageChannel,
    pub right: MessageChannel,
}

/// Two connected message channels sharing one region.
pub(crate) fn channel_pair(capacity: usize, policy: TurnPolicy) -> ChannelPair {
    let RegionPair {
        file,
        writer,
        reader,
    } = region_pair(capacity);
    let (a, b) = UnixStream::pair().expect("Failed to create socket pair");

    ChannelPair {
        file,
        left: MessageChannel::new(writer, ControlChannel::new(a), policy),
        right: MessageChannel::new(reader, ControlChannel::new(b), policy),
    }
}
