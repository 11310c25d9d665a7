//! Listening endpoints

use crate::channel::TcpChannel;
use crate::connection::{Connection, ConnectionConfig, ConnectionRole};
use crate::error::{OrbError, Result};
use crate::ior::{component_tag, IiopAddress, IorTemplate, TaggedComponent, TemplatePolicies};
use crate::service_context::ServiceContextRegistry;
use crate::socket_factory::SocketFactory;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One listen endpoint of a transport
pub trait Acceptor: Send + Sync {
    /// Bind the listening socket. Idempotent: only the call that binds
    /// returns `true`.
    fn initialize(&self) -> Result<bool>;

    fn is_initialized(&self) -> bool;

    /// Block until a peer connects and return its connection in OPENING
    /// state.
    fn accept(&self) -> Result<Arc<Connection>>;

    /// Stop listening and wake a blocked `accept`.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Contribute this endpoint to `template`.
    fn add_to_reference_template(
        &self,
        template: &mut IorTemplate,
        policies: &TemplatePolicies,
        codebase: Option<&str>,
    );

    fn transport_type(&self) -> String;

    fn host(&self) -> &str;

    /// Bound port once initialized, configured port before.
    fn port(&self) -> u16;

    fn monitoring_name(&self) -> String;

    fn object_adapter_manager_id(&self) -> Option<u32>;

    fn object_adapter_id(&self) -> Option<&str>;
}

#[derive(Debug)]
struct Endpoint {
    transport_type: String,
    port: u16,
}

/// Acceptor over a [`SocketFactory`] listener
pub struct SocketAcceptor {
    name: String,
    host: String,
    endpoint: Mutex<Endpoint>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: AtomicBool,
    socket_factory: Arc<dyn SocketFactory>,
    connection_config: ConnectionConfig,
    registry: Arc<ServiceContextRegistry>,
    object_adapter_manager_id: Option<u32>,
    object_adapter_id: Option<String>,
}

impl SocketAcceptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        transport_type: impl Into<String>,
        port: u16,
        socket_factory: Arc<dyn SocketFactory>,
        connection_config: ConnectionConfig,
        registry: Arc<ServiceContextRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            endpoint: Mutex::new(Endpoint {
                transport_type: transport_type.into(),
                port,
            }),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
            socket_factory,
            connection_config,
            registry,
            object_adapter_manager_id: None,
            object_adapter_id: None,
        }
    }

    /// Restrict this acceptor to one object adapter.
    pub fn for_object_adapter(mut self, manager_id: u32, adapter_id: impl Into<String>) -> Self {
        self.object_adapter_manager_id = Some(manager_id);
        self.object_adapter_id = Some(adapter_id.into());
        self
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        self.ensure_uninitialized("port")?;
        self.endpoint.lock().port = port;
        Ok(())
    }

    pub fn set_transport_type(&self, transport_type: impl Into<String>) -> Result<()> {
        self.ensure_uninitialized("transport type")?;
        self.endpoint.lock().transport_type = transport_type.into();
        Ok(())
    }

    fn ensure_uninitialized(&self, what: &str) -> Result<()> {
        if self.is_initialized() {
            return Err(OrbError::illegal_state(format!(
                "cannot change the {} of initialized acceptor {}",
                what,
                self.monitoring_name()
            )));
        }
        Ok(())
    }

    fn resolve(&self, port: u16) -> std::io::Result<SocketAddr> {
        (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{} resolves to no address", self.host),
                )
            })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Acceptor for SocketAcceptor {
    fn initialize(&self) -> Result<bool> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            return Ok(false);
        }
        if self.is_closed() {
            return Err(OrbError::illegal_state(format!(
                "acceptor {} is closed",
                self.name
            )));
        }
        let mut endpoint = self.endpoint.lock();
        let bound = self
            .resolve(endpoint.port)
            .and_then(|addr| {
                self.socket_factory
                    .create_server_socket(&endpoint.transport_type, addr)
            })
            .map_err(|e| OrbError::listener_init(&endpoint.transport_type, endpoint.port, e))?;
        if let Ok(addr) = bound.local_addr() {
            endpoint.port = addr.port();
        }
        info!(
            acceptor = %self.name,
            transport = %endpoint.transport_type,
            host = %self.host,
            port = endpoint.port,
            "Acceptor listening"
        );
        *listener = Some(Arc::new(bound));
        Ok(true)
    }

    fn is_initialized(&self) -> bool {
        self.listener.lock().is_some()
    }

    fn accept(&self) -> Result<Arc<Connection>> {
        let listener = self.listener.lock().clone().ok_or_else(|| {
            OrbError::uninitialized(format!("acceptor {} is not listening", self.name))
        })?;
        let (socket, peer) = listener
            .accept()
            .map_err(|e| OrbError::io(format!("acceptor {}", self.name), e))?;
        if self.is_closed() {
            return Err(OrbError::closed());
        }
        self.socket_factory
            .set_accepted_socket_options(self, &listener, &socket)
            .map_err(|e| OrbError::io(peer, e))?;
        debug!(acceptor = %self.name, %peer, "Accepted connection");
        Ok(Connection::new(
            Arc::new(TcpChannel::new(socket)),
            ConnectionRole::Server,
            self.connection_config.clone(),
            self.registry.clone(),
        ))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        // a blocked accept only returns once someone connects
        if let Ok(addr) = listener.local_addr() {
            let wake = if addr.ip().is_unspecified() {
                SocketAddr::new(
                    if addr.is_ipv4() {
                        std::net::Ipv4Addr::LOCALHOST.into()
                    } else {
                        std::net::Ipv6Addr::LOCALHOST.into()
                    },
                    addr.port(),
                )
            } else {
                addr
            };
            let _ = TcpStream::connect_timeout(&wake, Duration::from_secs(1));
        }
        info!(acceptor = %self.name, "Acceptor closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn add_to_reference_template(
        &self,
        template: &mut IorTemplate,
        policies: &TemplatePolicies,
        codebase: Option<&str>,
    ) {
        template.add_address(IiopAddress::new(self.host.clone(), self.port()), policies);
        if let Some(codebase) = codebase {
            if !template.has_component(component_tag::JAVA_CODEBASE) {
                template.add_component(TaggedComponent::java_codebase(codebase));
            }
        }
    }

    fn transport_type(&self) -> String {
        self.endpoint.lock().transport_type.clone()
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.endpoint.lock().port
    }

    fn monitoring_name(&self) -> String {
        let endpoint = self.endpoint.lock();
        format!("{}[{}:{}:{}]", self.name, endpoint.transport_type, self.host, endpoint.port)
    }

    fn object_adapter_manager_id(&self) -> Option<u32> {
        self.object_adapter_manager_id
    }

    fn object_adapter_id(&self) -> Option<&str> {
        self.object_adapter_id.as_deref()
    }
}

impl std::fmt::Debug for SocketAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketAcceptor")
            .field("name", &self.name)
            .field("endpoint", &*self.endpoint.lock())
            .field("initialized", &self.is_initialized())
            .field("closed", &self.is_closed())
            .finish()
    }
}
