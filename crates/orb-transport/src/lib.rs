//! IIOP-style ORB transport
//!
//! Connection and transport management for an object request broker:
//!
//! - [`TransportManager`] owns the [`Acceptor`]s, the cached
//!   [`Connection`]s and the worker pools
//! - [`Connection`] multiplexes concurrent requests over one channel by
//!   request id and tears down cleanly on failure, failing every pending
//!   request with a [`CompletionStatus`]-carrying error
//! - [`GiopVersion`] negotiation, with [`LegacyPeerPolicy`] deciding which
//!   peers get the 1.0 fallback
//! - [`ServiceContextRegistry`] decodes the out-of-band metadata attached
//!   to requests and replies
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use orb_transport::{
//!     AcceptorConfig, GiopVersion, OperationTable, OrbConfig, TransportManager,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let operations = Arc::new(OperationTable::new());
//! operations.register("echo", Ok);
//!
//! let server = TransportManager::builder(
//!     OrbConfig::default().with_acceptor(AcceptorConfig::tcp(2809)),
//! )
//! .dispatcher(operations)
//! .build()
//! .unwrap();
//! server.install_acceptors().unwrap();
//! server.start().unwrap();
//!
//! let client = TransportManager::new(OrbConfig::default()).unwrap();
//! let conn = client
//!     .get_outbound_connection("127.0.0.1:2809".parse().unwrap(), GiopVersion::V1_2, None)
//!     .unwrap();
//! let reply = conn
//!     .send_request("echo", Bytes::from_static(b"hello"), true, Duration::from_secs(5))
//!     .unwrap();
//! ```

pub mod acceptor;
pub mod channel;
pub mod config;
pub mod connection;
pub mod connection_cache;
pub mod dispatcher;
pub mod encapsulation;
pub mod error;
pub mod giop_version;
pub mod ior;
pub mod message;
pub mod orb_version;
pub mod service_context;
pub mod socket_factory;
pub mod transport_manager;
pub mod waiting_room;

pub use acceptor::{Acceptor, SocketAcceptor};
pub use channel::{Channel, TcpChannel};
pub use config::{AcceptorConfig, ConfigError, OrbConfig};
pub use connection::{
    CodeBase, CodeBaseResolver, Connection, ConnectionConfig, ConnectionRole, ConnectionState,
    InboundContext, ReaderMode, RequestDispatcher, Response,
};
pub use connection_cache::{ConnectionCache, ConnectionCacheStats};
pub use dispatcher::{OperationHandler, OperationTable};
pub use error::{CompletionStatus, ErrorKind, OrbError, Result};
pub use giop_version::GiopVersion;
pub use ior::{IiopAddress, IorTemplate, TaggedComponent, TemplatePolicies};
pub use message::{Message, ReplyMessage, ReplyStatus, RequestMessage};
pub use orb_version::{LegacyPeerPolicy, OrbVersion};
pub use service_context::{
    ServiceContext, ServiceContextRegistry, ServiceContexts, UnknownServiceContext,
};
pub use socket_factory::{DefaultSocketFactory, SocketFactory};
pub use transport_manager::{
    TransportManager, TransportManagerBuilder, TransportStats, TransportStatsSnapshot,
};
pub use waiting_room::{PendingReply, ResponseWaitingRoom};
