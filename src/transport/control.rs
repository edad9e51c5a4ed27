//! Control connection carrying length frames between the two endpoints.
//!
//! The control channel is any connected, ordered, reliable byte stream: TCP,
//! a Unix domain socket, or (on Linux) an AF_VSOCK socket between a guest and
//! its host. Payload bytes never travel over it; it only signals message
//! boundaries.
//!
//! # Endpoints
//!
//! ```text
//! tcp:10.0.1.2:9000      TCP address
//! unix:/tmp/khala.sock   Unix domain socket path
//! vsock:3:9000           VM socket CID and port ("any" binds VMADDR_CID_ANY)
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::debug;

use crate::transport::error::{Result, TransportError};

/// Wildcard CID accepted by a vsock listener.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Byte stream usable as a control channel.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// Address of the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ControlEndpoint {
    /// `host:port` TCP address
    Tcp(String),
    /// Unix domain socket path
    Unix(PathBuf),
    /// VM socket context ID and port
    Vsock {
        /// Context ID
        cid: u32,
        /// Port number
        port: u32,
    },
}

impl ControlEndpoint {
    /// Connect to the endpoint (guest side).
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the connection cannot be established.
    /// There is no automatic retry.
    pub async fn connect(&self) -> Result<ControlChannel> {
        let peer = self.to_string();
        debug!("Connecting control channel to {}", peer);

        match self {
            ControlEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())
                    .await
                    .map_err(TransportError::Io)?;
                // Frames are 4 bytes; never let Nagle hold one back.
                stream.set_nodelay(true).map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(stream, peer))
            }
            ControlEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(stream, peer))
            }
            #[cfg(target_os = "linux")]
            ControlEndpoint::Vsock { cid, port } => {
                let stream = tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(
                    *cid, *port,
                ))
                .await
                .map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(stream, peer))
            }
            #[cfg(not(target_os = "linux"))]
            ControlEndpoint::Vsock { .. } => Err(vsock_unsupported()),
        }
    }

    /// Bind a listener on the endpoint (host side).
    ///
    /// A stale Unix socket left by a previous run is removed first.
    pub async fn bind(&self) -> Result<ControlListener> {
        match self {
            ControlEndpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .map_err(TransportError::Io)?;
                Ok(ControlListener::Tcp(listener))
            }
            ControlEndpoint::Unix(path) => {
                remove_stale_socket(path);
                let listener = UnixListener::bind(path).map_err(TransportError::Io)?;
                Ok(ControlListener::Unix(listener))
            }
            #[cfg(target_os = "linux")]
            ControlEndpoint::Vsock { cid, port } => {
                let listener =
                    tokio_vsock::VsockListener::bind(tokio_vsock::VsockAddr::new(*cid, *port))
                        .map_err(TransportError::Io)?;
                Ok(ControlListener::Vsock(listener))
            }
            #[cfg(not(target_os = "linux"))]
            ControlEndpoint::Vsock { .. } => Err(vsock_unsupported()),
        }
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlEndpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
            ControlEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            ControlEndpoint::Vsock { cid, port } if *cid == VMADDR_CID_ANY => {
                write!(f, "vsock:any:{}", port)
            }
            ControlEndpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

impl FromStr for ControlEndpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("Invalid control endpoint '{}'", s);
        let (scheme, rest) = s.split_once(':').ok_or_else(invalid)?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" if !rest.is_empty() && rest.contains(':') => {
                Ok(ControlEndpoint::Tcp(rest.to_string()))
            }
            "unix" if !rest.is_empty() => Ok(ControlEndpoint::Unix(PathBuf::from(rest))),
            "vsock" => {
                let (cid, port) = rest.split_once(':').ok_or_else(invalid)?;
                let cid = if cid.eq_ignore_ascii_case("any") {
                    VMADDR_CID_ANY
                } else {
                    cid.parse().map_err(|_| invalid())?
                };
                let port = port.parse().map_err(|_| invalid())?;
                Ok(ControlEndpoint::Vsock { cid, port })
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for ControlEndpoint {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ControlEndpoint> for String {
    fn from(endpoint: ControlEndpoint) -> Self {
        endpoint.to_string()
    }
}

/// Listening side of a control channel.
pub enum ControlListener {
    /// TCP listener
    Tcp(TcpListener),
    /// Unix domain socket listener
    Unix(UnixListener),
    /// VM socket listener
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockListener),
}

impl ControlListener {
    /// Wait for the next peer.
    pub async fn accept(&mut self) -> Result<ControlChannel> {
        match self {
            ControlListener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Io)?;
                stream.set_nodelay(true).map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(stream, format!("tcp:{}", addr)))
            }
            ControlListener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await.map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(stream, "unix"))
            }
            #[cfg(target_os = "linux")]
            ControlListener::Vsock(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Io)?;
                Ok(ControlChannel::with_peer(
                    stream,
                    format!("vsock:{}:{}", addr.cid(), addr.port()),
                ))
            }
        }
    }

    /// The endpoint actually bound, with any port 0 resolved.
    pub fn local_endpoint(&self) -> Result<ControlEndpoint> {
        match self {
            ControlListener::Tcp(listener) => {
                let addr = listener.local_addr().map_err(TransportError::Io)?;
                Ok(ControlEndpoint::Tcp(addr.to_string()))
            }
            ControlListener::Unix(listener) => {
                let addr = listener.local_addr().map_err(TransportError::Io)?;
                let path = addr.as_pathname().ok_or_else(|| {
                    TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "unnamed Unix socket",
                    ))
                })?;
                Ok(ControlEndpoint::Unix(path.to_path_buf()))
            }
            #[cfg(target_os = "linux")]
            ControlListener::Vsock(listener) => {
                let addr = listener.local_addr().map_err(TransportError::Io)?;
                Ok(ControlEndpoint::Vsock {
                    cid: addr.cid(),
                    port: addr.port(),
                })
            }
        }
    }
}

/// A connected control stream.
///
/// `send_exact` and `recv_exact` hide short writes and short reads; callers
/// only ever see whole buffers, a clean close, or an error.
pub struct ControlChannel {
    stream: Box<dyn ControlStream>,
    peer: String,
}

impl ControlChannel {
    /// Wrap an already connected stream.
    pub fn new<S: ControlStream + 'static>(stream: S) -> Self {
        Self::with_peer(stream, "stream")
    }

    /// Wrap an already connected stream, labelled with `peer` for logging.
    pub fn with_peer<S: ControlStream + 'static>(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
        }
    }

    /// Peer label used in log messages.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Push all of `bytes` onto the stream.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionClosed` if the peer went away
    /// mid-write, `TransportError::Io` for anything else.
    pub async fn send_exact(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Fill `buf` completely.
    ///
    /// Returns `Ok(false)` if the peer closed the stream before `buf` was
    /// full. A close is the normal end of a session, not an error; any bytes
    /// already collected are discarded by the caller.
    pub async fn recv_into(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.stream.read(&mut buf[filled..]).await?;
            if read == 0 {
                if filled > 0 {
                    debug!(
                        "Peer {} closed after {} of {} bytes",
                        self.peer,
                        filled,
                        buf.len()
                    );
                }
                return Ok(false);
            }
            filled += read;
        }
        Ok(true)
    }

    /// Collect exactly `n` bytes, or `None` if the peer closed first.
    pub async fn recv_exact(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; n];
        if self.recv_into(&mut buf).await? {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    /// Close the write side, signalling end of session to the peer.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn remove_stale_socket(path: &std::path::Path) {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if metadata.file_type().is_socket() {
            debug!("Removing stale socket {}", path.display());
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn vsock_unsupported() -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock control channels are only available on Linux",
    ))
}
