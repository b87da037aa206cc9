use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ProtocolError, Reply, Request};
use crate::MESSAGE_MAX_LENGTH;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("control plane i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds the limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// A synchronous request/reply channel to the page engine.
pub trait Transport {
    /// Send one encoded request and block for its reply.
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Encode `request`, exchange it, and decode the reply sent for it.
    fn call(&self, request: &Request) -> Result<Reply, TransportError> {
        let bytes = request.encode()?;
        let reply = self.round_trip(&bytes)?;
        Ok(Reply::decode(request.kind, &reply)?)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bound on each read and write of one exchange. `None` blocks indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Client end of the engine's Unix socket.
///
/// Every exchange uses a fresh connection, the engine serves one connection at a time.
#[derive(Clone, Debug)]
pub struct UnixTransport {
    path: PathBuf,
    config: TransportConfig,
}

impl UnixTransport {
    pub fn new(path: impl Into<PathBuf>, config: TransportConfig) -> Self {
        UnixTransport {
            path: path.into(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for UnixTransport {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut stream = UnixStream::connect(&self.path)?;
        stream.set_read_timeout(self.config.timeout)?;
        stream.set_write_timeout(self.config.timeout)?;

        write_frame(&mut stream, request)?;
        read_frame(&mut stream)
    }
}

/// Write one message, prefixed by its length as a little-endian `u32`.
pub(crate) fn write_frame(stream: &mut impl Write, bytes: &[u8]) -> Result<(), TransportError> {
    if bytes.len() > MESSAGE_MAX_LENGTH {
        return Err(TransportError::FrameTooLarge {
            len: bytes.len(),
            max: MESSAGE_MAX_LENGTH,
        });
    }

    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(bytes)?;
    stream.flush()?;
    Ok(())
}

/// Read one message. The length is checked before anything is allocated.
pub(crate) fn read_frame(stream: &mut impl Read) -> Result<Vec<u8>, TransportError> {
    let mut len = [0; 4];
    stream.read_exact(&mut len)?;

    let len = u32::from_le_bytes(len) as usize;
    if len > MESSAGE_MAX_LENGTH {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MESSAGE_MAX_LENGTH,
        });
    }

    let mut bytes = vec![0; len];
    stream.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[test]
fn frame_roundtrip_and_limit() {
    let mut wire = Vec::new();
    write_frame(&mut wire, b"hello").unwrap();
    assert_eq!(&wire[..4], &5u32.to_le_bytes());
    assert_eq!(read_frame(&mut &wire[..]).unwrap(), b"hello");

    let oversized = vec![0; MESSAGE_MAX_LENGTH + 1];
    assert!(matches!(
        write_frame(&mut Vec::new(), &oversized),
        Err(TransportError::FrameTooLarge { .. })
    ));

    let lying = ((MESSAGE_MAX_LENGTH + 1) as u32).to_le_bytes();
    assert!(matches!(
        read_frame(&mut &lying[..]),
        Err(TransportError::FrameTooLarge { .. })
    ));

    // Truncated payload.
    assert!(matches!(
        read_frame(&mut &wire[..6]),
        Err(TransportError::Io(_))
    ));
}
