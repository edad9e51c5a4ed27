//! 4-byte length framing for the control channel.
//!
//! # Wire Format
//!
//! ```text
//! +--------+--------+--------+--------+
//! |        length (u32, big-endian)   |
//! +--------+--------+--------+--------+
//! ```
//!
//! A frame carries only a byte count. The bytes it counts live in the
//! shared region, not on the stream. For chunked transfers a frame of `0`
//! is the terminator.

use tracing::trace;

use crate::transport::control::ControlChannel;
use crate::transport::error::{Result, TransportError};

/// Size of an encoded frame.
pub const FRAME_LEN: usize = 4;

/// Frame value ending a chunked transfer.
pub const TERMINATOR: u32 = 0;

/// Encode a length as a big-endian frame.
pub fn encode_length(n: u32) -> [u8; FRAME_LEN] {
    n.to_be_bytes()
}

/// Decode a big-endian frame.
pub fn decode_length(frame: [u8; FRAME_LEN]) -> u32 {
    u32::from_be_bytes(frame)
}

/// Convert a payload length to a frame value.
///
/// # Errors
///
/// Returns `TransportError::FrameTooLarge` if `len` exceeds `u32::MAX`.
pub fn frame_length(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| TransportError::FrameTooLarge(len))
}

/// Read one frame, or `None` if the peer closed before all 4 bytes arrived.
pub async fn read_frame(control: &mut ControlChannel) -> Result<Option<u32>> {
    let mut frame = [0u8; FRAME_LEN];
    if !control.recv_into(&mut frame).await? {
        return Ok(None);
    }

    let length = decode_length(frame);
    trace!("Frame <- {}: {}", control.peer(), length);
    Ok(Some(length))
}

/// Write one frame.
pub async fn write_frame(control: &mut ControlChannel, length: u32) -> Result<()> {
    trace!("Frame -> {}: {}", control.peer(), length);
    control.send_exact(&encode_length(length)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_encode_hello_world_length() {
        let payload = b"Hello, world!";
        assert_eq!(payload.len(), 13);
        assert_eq!(encode_length(13), [0x00, 0x00, 0x00, 0x0D]);
    }

    #[test]
    fn test_codec_is_big_endian() {
        assert_eq!(encode_length(0x0102_0304), [1, 2, 3, 4]);
        assert_eq!(decode_length([1, 2, 3, 4]), 0x0102_0304);
        assert_eq!(decode_length(encode_length(u32::MAX)), u32::MAX);
        assert_eq!(encode_length(TERMINATOR), [0; 4]);
    }

    #[test]
    fn test_frame_length_bounds() {
        assert_eq!(frame_length(40 * 1024 * 1024).unwrap(), 40 * 1024 * 1024);
        assert_eq!(frame_length(u32::MAX as usize).unwrap(), u32::MAX);

        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            frame_length(u32::MAX as usize + 1),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_write_read_frame() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut writer = ControlChannel::new(a);
        let mut reader = ControlChannel::new(b);

        write_frame(&mut writer, 13).await.unwrap();
        write_frame(&mut writer, TERMINATOR).await.unwrap();

        let first = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .unwrap();
        let second = read_frame(&mut reader).await.unwrap();

        assert_eq!(first, Some(13));
        assert_eq!(second, Some(TERMINATOR));
    }

    #[tokio::test]
    async fn test_partial_frame_then_close_is_none() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut reader = ControlChannel::new(a);

        b.write_all(&[0x00, 0x00]).await.unwrap();
        drop(b);

        let frame = timeout(TEST_TIMEOUT, read_frame(&mut reader))
            .await
            .expect("Test timed out")
            .unwrap();
        assert_eq!(frame, None);
    }
}
