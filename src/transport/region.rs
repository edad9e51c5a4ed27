//! Memory-mapped shared region.
//!
//! A `SharedRegion` is a single reusable slot of `capacity` bytes mapped
//! `MAP_SHARED` from a backing file or device. Writes always start at offset
//! 0 and overwrite whatever the previous message left behind.
//!
//! The region does no synchronization of its own. Exclusive access is handed
//! back and forth by the frame handshake on the control channel: a writer may
//! only announce after its write completes, and a reader may only read after
//! it has consumed the announcing frame.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

use crate::transport::error::{Result, TransportError};

/// Bytes zeroed by [`SharedRegion::clear_header`].
const HEADER_LEN: usize = 4;

/// Fixed-capacity byte buffer shared between two processes.
pub struct SharedRegion {
    map: MmapMut,
    path: PathBuf,
    offset: u64,
}

impl SharedRegion {
    /// Map `capacity` bytes of `path` starting at `offset`.
    ///
    /// The backing resource must already exist. Regular files must be at
    /// least `offset + capacity` bytes long; device nodes report no length
    /// and are trusted to be large enough.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::RegionOpen` if the resource is missing, too
    /// small, or cannot be mapped. This is a misconfiguration and is never
    /// retried.
    pub fn open(path: impl AsRef<Path>, offset: u64, capacity: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| open_error(path, e))?;

        let metadata = file.metadata().map_err(|e| open_error(path, e))?;
        if metadata.is_file() {
            let required = offset.saturating_add(capacity as u64);
            if metadata.len() < required {
                return Err(open_error(
                    path,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!(
                            "backing file is {} bytes, need at least {}",
                            metadata.len(),
                            required
                        ),
                    ),
                ));
            }
        }

        // SAFETY: the mapping is shared with exactly one peer process, and
        // all access goes through `write`/`read`, which the frame handshake
        // serializes. Truncating the backing file while mapped is outside
        // the contract of the region.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(capacity)
                .map_mut(&file)
        }
        .map_err(|e| open_error(path, e))?;

        debug!(
            "Mapped shared region {} (offset {}, {} bytes)",
            path.display(),
            offset,
            capacity
        );

        Ok(Self {
            map,
            path: path.to_path_buf(),
            offset,
        })
    }

    /// Region capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Backing file or device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the mapping within the backing resource.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Copy `bytes` into the region starting at offset 0.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::CapacityExceeded` if `bytes` is longer than
    /// the region.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes.len())?;
        self.map[..bytes.len()].copy_from_slice(bytes);
        // Publish the bytes before the caller announces them.
        fence(Ordering::Release);
        Ok(())
    }

    /// Return a copy of the first `n` bytes of the region.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::CapacityExceeded` if `n` is larger than the
    /// region.
    pub fn read(&self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        self.read_into(n, &mut out)?;
        Ok(out)
    }

    /// Append the first `n` bytes of the region to `out`.
    pub fn read_into(&self, n: usize, out: &mut Vec<u8>) -> Result<()> {
        self.check_len(n)?;
        fence(Ordering::Acquire);
        out.extend_from_slice(&self.map[..n]);
        Ok(())
    }

    /// Flush outstanding writes to the backing resource.
    pub fn flush(&self) -> Result<()> {
        self.map.flush().map_err(TransportError::Io)
    }

    /// Zero the leading bytes of the region and flush, so a later peer
    /// never sees a stale header.
    pub fn clear_header(&mut self) -> Result<()> {
        let len = HEADER_LEN.min(self.capacity());
        self.map[..len].fill(0);
        self.flush()
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.capacity() {
            return Err(TransportError::CapacityExceeded {
                len,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn open_error(path: &Path, source: io::Error) -> TransportError {
    TransportError::RegionOpen {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{backing_file, region_pair};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_write_exactly_capacity_succeeds() {
        let mut pair = region_pair(16);
        let payload = [0xAB; 16];

        pair.writer.write(&payload).expect("Write of exactly C bytes");
        assert_eq!(pair.reader.read(16).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_write_over_capacity_fails() {
        let mut pair = region_pair(16);

        let err = pair.writer.write(&[0u8; 17]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::CapacityExceeded {
                len: 17,
                capacity: 16
            }
        ));
    }

    #[test]
    fn test_read_over_capacity_fails() {
        let pair = region_pair(16);
        assert!(matches!(
            pair.reader.read(17),
            Err(TransportError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn test_write_overwrites_from_offset_zero() {
        let mut pair = region_pair(32);

        pair.writer.write(b"Hello, world!").unwrap();
        pair.writer.write(b"Bye").unwrap();

        // Only the prefix is replaced; the tail of the old message remains.
        assert_eq!(pair.reader.read(13).unwrap(), b"Byelo, world!".to_vec());
    }

    #[test]
    fn test_read_into_appends() {
        let mut pair = region_pair(8);
        let mut out = b"ab".to_vec();

        pair.writer.write(b"cdef").unwrap();
        pair.reader.read_into(4, &mut out).unwrap();

        assert_eq!(out, b"abcdef".to_vec());
    }

    #[test]
    fn test_open_with_offset() {
        let file = backing_file(64);
        let mut outer = SharedRegion::open(file.path(), 0, 64).unwrap();
        let mut inner = SharedRegion::open(file.path(), 32, 16).unwrap();

        inner.write(b"offset").unwrap();
        assert_eq!(inner.offset(), 32);
        assert_eq!(outer.read(38).unwrap()[32..].to_vec(), b"offset".to_vec());

        outer.write(&[0u8; 64]).unwrap();
        assert_eq!(inner.read(6).unwrap(), vec![0u8; 6]);
    }

    #[test]
    fn test_open_missing_file_fails() {
        let err = SharedRegion::open("/nonexistent/khala-shmem", 0, 16).unwrap_err();
        assert!(matches!(err, TransportError::RegionOpen { .. }));
    }

    #[test]
    fn test_open_undersized_file_fails() {
        let file = backing_file(8);
        let err = SharedRegion::open(file.path(), 0, 16).unwrap_err();

        let msg = err.to_string();
        assert!(
            msg.contains("need at least 16"),
            "Expected size error, got: {}",
            msg
        );
    }

    #[test]
    fn test_clear_header() {
        let mut pair = region_pair(16);

        pair.writer.write(b"\x00\x00\x00\x0dHello").unwrap();
        pair.writer.clear_header().unwrap();

        assert_eq!(pair.reader.read(9).unwrap(), b"\x00\x00\x00\x00Hello".to_vec());
    }
}
