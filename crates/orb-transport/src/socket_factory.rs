//! Socket creation hooks

use crate::acceptor::Acceptor;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::debug;

/// Clear-text IIOP over TCP
pub const TCP: &str = "tcp";

/// Creates listening and outbound sockets for a transport type.
pub trait SocketFactory: Send + Sync {
    fn create_server_socket(&self, transport_type: &str, addr: SocketAddr) -> io::Result<TcpListener>;

    fn create_socket(&self, transport_type: &str, addr: SocketAddr) -> io::Result<TcpStream>;

    /// Applied to every socket an acceptor accepts.
    fn set_accepted_socket_options(
        &self,
        acceptor: &dyn Acceptor,
        listener: &TcpListener,
        socket: &TcpStream,
    ) -> io::Result<()>;
}

/// Plain TCP with `TCP_NODELAY`
#[derive(Debug, Clone, Default)]
pub struct DefaultSocketFactory {
    connect_timeout: Option<Duration>,
}

impl DefaultSocketFactory {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    fn check_type(transport_type: &str) -> io::Result<()> {
        if transport_type.eq_ignore_ascii_case(TCP) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported transport type {:?}", transport_type),
            ))
        }
    }
}

impl SocketFactory for DefaultSocketFactory {
    fn create_server_socket(&self, transport_type: &str, addr: SocketAddr) -> io::Result<TcpListener> {
        Self::check_type(transport_type)?;
        TcpListener::bind(addr)
    }

    fn create_socket(&self, transport_type: &str, addr: SocketAddr) -> io::Result<TcpStream> {
        Self::check_type(transport_type)?;
        let stream = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn set_accepted_socket_options(
        &self,
        acceptor: &dyn Acceptor,
        _listener: &TcpListener,
        socket: &TcpStream,
    ) -> io::Result<()> {
        debug!(acceptor = %acceptor.monitoring_name(), peer = ?socket.peer_addr().ok(), "Accepted socket");
        socket.set_nodelay(true)
    }
}
