//! Byte channels underneath connections

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// A bidirectional byte stream usable from several threads.
///
/// Reads and writes are serialized by the connection, so implementations
/// only need to tolerate one reader and one writer at a time.
pub trait Channel: Send + Sync {
    /// Read at most `buf.len()` bytes, waiting at most `timeout`
    /// (`None` waits indefinitely). `Ok(0)` means end of stream; an expired
    /// timeout surfaces as `WouldBlock` or `TimedOut`.
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize>;

    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    /// Close both directions, waking a blocked reader.
    fn shutdown(&self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Whether readiness can be multiplexed onto shared threads.
    fn is_event_driven(&self) -> bool {
        false
    }
}

/// Blocking TCP channel
#[derive(Debug)]
pub struct TcpChannel {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();
        Self {
            stream,
            peer,
            local,
        }
    }
}

impl Channel for TcpChannel {
    fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        // a zero timeout would be rejected by the socket
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.stream.set_read_timeout(timeout)?;
        (&self.stream).read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        (&self.stream).write_all(buf)?;
        (&self.stream).flush()
    }

    fn shutdown(&self) {
        // already-closed sockets report NotConnected
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}
