//! Transport manager
//!
//! Owns the acceptors, the connection cache and the thread pools of an
//! ORB. Acceptors are installed once, then [`TransportManager::start`]
//! binds them and runs one accept loop per acceptor.

use crate::acceptor::{Acceptor, SocketAcceptor};
use crate::channel::TcpChannel;
use crate::config::OrbConfig;
use crate::connection::{Connection, ConnectionRole, InboundContext, RequestDispatcher};
use crate::connection_cache::{ConnectionCache, ConnectionCacheStats};
use crate::error::{CompletionStatus, OrbError, Result};
use crate::giop_version::GiopVersion;
use crate::ior::{component_tag, IorTemplate, TaggedComponent, TemplatePolicies};
use crate::orb_version::OrbVersion;
use crate::service_context::ServiceContextRegistry;
use crate::socket_factory::{DefaultSocketFactory, SocketFactory, TCP};
use orb_threadpool::ThreadPoolManager;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Transport statistics
#[derive(Debug, Default)]
pub struct TransportStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub outbound_connections_opened: AtomicU64,
    pub outbound_connections_reused: AtomicU64,
    pub connections_reclaimed: AtomicU64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            outbound_connections_opened: self.outbound_connections_opened.load(Ordering::Relaxed),
            outbound_connections_reused: self.outbound_connections_reused.load(Ordering::Relaxed),
            connections_reclaimed: self.connections_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transport statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub outbound_connections_opened: u64,
    pub outbound_connections_reused: u64,
    pub connections_reclaimed: u64,
}

/// Builder for [`TransportManager`]
pub struct TransportManagerBuilder {
    config: OrbConfig,
    socket_factory: Option<Arc<dyn SocketFactory>>,
    registry: Option<ServiceContextRegistry>,
    dispatcher: Option<Arc<dyn RequestDispatcher>>,
}

impl TransportManagerBuilder {
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    /// Defaults to [`ServiceContextRegistry::with_standard_contexts`].
    pub fn service_context_registry(mut self, registry: ServiceContextRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Executes inbound requests. Without one every request is answered
    /// with a system exception.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> Result<TransportManager> {
        let thread_pools = ThreadPoolManager::new(self.config.thread_pool.clone())?;
        let inbound = Arc::new(InboundContext::new(
            thread_pools.default_pool(),
            self.dispatcher,
        ));
        let socket_factory = self
            .socket_factory
            .unwrap_or_else(|| Arc::new(DefaultSocketFactory::new(self.config.connect_timeout)));
        let registry = Arc::new(
            self.registry
                .unwrap_or_else(ServiceContextRegistry::with_standard_contexts),
        );
        Ok(TransportManager {
            cache: Arc::new(ConnectionCache::new(
                self.config.cache_high_water_mark,
                self.config.cache_reclaim_count,
            )),
            config: self.config,
            socket_factory,
            registry,
            thread_pools,
            inbound,
            acceptors: RwLock::new(None),
            accept_threads: Mutex::new(Vec::new()),
            stats: Arc::new(TransportStats::default()),
            closed: AtomicBool::new(false),
        })
    }
}

/// Acceptors, connections and worker pools of one ORB
pub struct TransportManager {
    config: OrbConfig,
    socket_factory: Arc<dyn SocketFactory>,
    registry: Arc<ServiceContextRegistry>,
    thread_pools: ThreadPoolManager,
    inbound: Arc<InboundContext>,
    /// `None` until acceptors are installed
    acceptors: RwLock<Option<Vec<Arc<dyn Acceptor>>>>,
    cache: Arc<ConnectionCache>,
    accept_threads: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<TransportStats>,
    closed: AtomicBool,
}

impl TransportManager {
    pub fn builder(config: OrbConfig) -> TransportManagerBuilder {
        TransportManagerBuilder {
            config,
            socket_factory: None,
            registry: None,
            dispatcher: None,
        }
    }

    pub fn new(config: OrbConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &OrbConfig {
        &self.config
    }

    pub fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub fn service_context_registry(&self) -> &Arc<ServiceContextRegistry> {
        &self.registry
    }

    pub fn thread_pool_manager(&self) -> &ThreadPoolManager {
        &self.thread_pools
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    pub fn connection_cache(&self) -> &Arc<ConnectionCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> ConnectionCacheStats {
        self.cache.stats()
    }

    /// Create one [`SocketAcceptor`] per configured endpoint. Marks the
    /// acceptor set as installed even when the configuration lists none.
    pub fn install_acceptors(&self) -> Result<()> {
        let mut acceptors = self.acceptors.write();
        let installed = acceptors.get_or_insert_with(Vec::new);
        for (index, endpoint) in self.config.acceptors.iter().enumerate() {
            let name = endpoint
                .name
                .clone()
                .unwrap_or_else(|| format!("acceptor-{}", index));
            let acceptor = SocketAcceptor::new(
                name,
                self.config.host.clone(),
                endpoint.transport_type.clone(),
                endpoint.port,
                self.socket_factory.clone(),
                self.config.connection_config(),
                self.registry.clone(),
            );
            debug!("Installing acceptor {}", acceptor.monitoring_name());
            installed.push(Arc::new(acceptor));
        }
        info!("Installed {} acceptor(s)", installed.len());
        Ok(())
    }

    /// Install an acceptor built elsewhere.
    pub fn add_acceptor(&self, acceptor: Arc<dyn Acceptor>) {
        debug!("Adding acceptor {}", acceptor.monitoring_name());
        self.acceptors
            .write()
            .get_or_insert_with(Vec::new)
            .push(acceptor);
    }

    /// Acceptors serving an object adapter.
    ///
    /// With both filters `None` every acceptor is returned; otherwise an
    /// acceptor matches when its ids equal the given ones. Fails with
    /// [`crate::ErrorKind::Uninitialized`] before any acceptor was
    /// installed.
    pub fn get_acceptors(
        &self,
        object_adapter_manager_id: Option<u32>,
        object_adapter_id: Option<&str>,
    ) -> Result<Vec<Arc<dyn Acceptor>>> {
        let acceptors = self.acceptors.read();
        let acceptors = acceptors
            .as_ref()
            .ok_or_else(|| OrbError::uninitialized("no acceptors have been installed"))?;
        if object_adapter_manager_id.is_none() && object_adapter_id.is_none() {
            return Ok(acceptors.clone());
        }
        Ok(acceptors
            .iter()
            .filter(|a| {
                a.object_adapter_manager_id() == object_adapter_manager_id
                    && a.object_adapter_id() == object_adapter_id
            })
            .cloned()
            .collect())
    }

    /// Contribute the matching acceptors' endpoints to `template`, plus
    /// our ORB type and native code sets.
    pub fn add_to_ior_template(
        &self,
        template: &mut IorTemplate,
        policies: &TemplatePolicies,
        codebase: Option<&str>,
        object_adapter_manager_id: Option<u32>,
        object_adapter_id: Option<&str>,
    ) -> Result<()> {
        let acceptors = self.get_acceptors(object_adapter_manager_id, object_adapter_id)?;
        if !template.has_component(component_tag::ORB_TYPE) {
            template.add_component(TaggedComponent::orb_type(u32::from(
                self.config.orb_version.orb_type(),
            )));
        }
        if !template.has_component(component_tag::CODE_SETS) {
            template.add_component(TaggedComponent::code_sets(
                self.config.char_codeset,
                self.config.wchar_codeset,
            ));
        }
        for acceptor in acceptors {
            acceptor.add_to_reference_template(template, policies, codebase);
        }
        Ok(())
    }

    /// Bind every installed acceptor and start accepting.
    pub fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrbError::illegal_state("transport manager is closed"));
        }
        let acceptors = self.get_acceptors(None, None)?;
        let mut threads = self.accept_threads.lock();
        for acceptor in acceptors {
            if !acceptor.initialize()? {
                // already bound, and its accept loop already runs
                continue;
            }
            let cache = self.cache.clone();
            let inbound = self.inbound.clone();
            let stats = self.stats.clone();
            let handle = thread::Builder::new()
                .name(format!("orb-accept-{}", acceptor.port()))
                .spawn(move || accept_loop(acceptor, cache, inbound, stats))
                .map_err(|e| OrbError::io("accept thread", e))?;
            threads.push(handle);
        }
        Ok(())
    }

    /// A cached or newly opened connection to `addr`.
    ///
    /// New connections negotiate their request version from the peer's
    /// advertised GIOP version and, when known, its ORB version. A cached
    /// connection keeps the version it negotiated when it was opened.
    pub fn get_outbound_connection(
        &self,
        addr: SocketAddr,
        peer_version: GiopVersion,
        peer_orb: Option<OrbVersion>,
    ) -> Result<Arc<Connection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OrbError::illegal_state("transport manager is closed"));
        }
        if let Some(conn) = self.cache.get_outbound(&addr) {
            self.stats
                .outbound_connections_reused
                .fetch_add(1, Ordering::Relaxed);
            // connections are cached per address and keep their negotiated version
            let wanted = conn.preferred_request_version(peer_version, peer_orb);
            if wanted != conn.giop_version() {
                debug!(
                    "Reusing connection {} to {} at GIOP {}, not the requested {}",
                    conn.id(),
                    addr,
                    conn.giop_version(),
                    wanted
                );
            }
            return Ok(conn);
        }

        let socket = self
            .socket_factory
            .create_socket(TCP, addr)
            .map_err(|e| OrbError::io(addr, e).with_completion(CompletionStatus::NotCompleted))?;
        let conn = Connection::new(
            Arc::new(TcpChannel::new(socket)),
            ConnectionRole::Client,
            self.config.connection_config(),
            self.registry.clone(),
        );
        conn.negotiate_request_version(peer_version, peer_orb);

        let cached = self.cache.put_outbound(addr, conn.clone());
        if !Arc::ptr_eq(&cached, &conn) {
            // another thread connected first
            conn.close();
            return Ok(cached);
        }
        conn.start_reader(self.inbound.clone())?;
        self.stats
            .outbound_connections_opened
            .fetch_add(1, Ordering::Relaxed);
        info!("Opened connection {} to {}", conn.id(), addr);
        self.reclaim();
        Ok(conn)
    }

    /// Close idle connections if the cache is over its high water mark.
    pub fn reclaim(&self) -> usize {
        let reclaimed = self.cache.reclaim();
        if reclaimed > 0 {
            self.stats
                .connections_reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
        }
        reclaimed
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.cache.connections()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting, close every connection and shut the pools down.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(acceptors) = self.acceptors.read().as_ref() {
            for acceptor in acceptors {
                acceptor.close();
            }
        }
        let threads: Vec<JoinHandle<()>> = self.accept_threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Accept thread panicked");
            }
        }
        self.cache.close_all();
        self.thread_pools.close();
        info!("Transport manager closed");
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(
    acceptor: Arc<dyn Acceptor>,
    cache: Arc<ConnectionCache>,
    inbound: Arc<InboundContext>,
    stats: Arc<TransportStats>,
) {
    info!("Accepting on {}", acceptor.monitoring_name());
    loop {
        match acceptor.accept() {
            Ok(conn) => {
                stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                cache.put_inbound(conn.clone());
                if let Err(e) = conn.start_reader(inbound.clone()) {
                    warn!("Cannot start reader for connection from {}: {}", conn.peer(), e);
                    stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                    cache.remove(&conn);
                    conn.abort("reader could not be started");
                }
                let reclaimed = cache.reclaim();
                if reclaimed > 0 {
                    stats
                        .connections_reclaimed
                        .fetch_add(reclaimed as u64, Ordering::Relaxed);
                }
            }
            Err(_) if acceptor.is_closed() => break,
            Err(e) => {
                warn!("Accept failed on {}: {}", acceptor.monitoring_name(), e);
                thread::sleep(std::time::Duration::from_millis(10));
            }
        }
    }
    info!("Stopped accepting on {}", acceptor.monitoring_name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AcceptorConfig;
    use crate::error::ErrorKind;
    use crate::ior::IiopAddress;

    struct TaggedAcceptor {
        inner: SocketAcceptor,
    }

    impl TaggedAcceptor {
        fn new(port: u16, manager_id: u32, adapter_id: &str) -> Self {
            Self {
                inner: SocketAcceptor::new(
                    format!("oa-{}", adapter_id),
                    "127.0.0.1",
                    TCP,
                    port,
                    Arc::new(DefaultSocketFactory::default()),
                    Default::default(),
                    Arc::new(ServiceContextRegistry::new()),
                )
                .for_object_adapter(manager_id, adapter_id),
            }
        }
    }

    impl Acceptor for TaggedAcceptor {
        fn initialize(&self) -> Result<bool> {
            self.inner.initialize()
        }
        fn is_initialized(&self) -> bool {
            self.inner.is_initialized()
        }
        fn accept(&self) -> Result<Arc<Connection>> {
            self.inner.accept()
        }
        fn close(&self) {
            self.inner.close()
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
        fn add_to_reference_template(
            &self,
            template: &mut IorTemplate,
            policies: &TemplatePolicies,
            codebase: Option<&str>,
        ) {
            self.inner.add_to_reference_template(template, policies, codebase)
        }
        fn transport_type(&self) -> String {
            self.inner.transport_type()
        }
        fn host(&self) -> &str {
            self.inner.host()
        }
        fn port(&self) -> u16 {
            self.inner.port()
        }
        fn monitoring_name(&self) -> String {
            self.inner.monitoring_name()
        }
        fn object_adapter_manager_id(&self) -> Option<u32> {
            self.inner.object_adapter_manager_id()
        }
        fn object_adapter_id(&self) -> Option<&str> {
            self.inner.object_adapter_id()
        }
    }

    #[test]
    fn test_get_acceptors_before_install_is_uninitialized() {
        let manager = TransportManager::new(OrbConfig::default()).unwrap();
        let err = manager.get_acceptors(None, None).err().unwrap();
        assert!(matches!(err.kind(), ErrorKind::Uninitialized(_)));

        manager.install_acceptors().unwrap();
        assert!(manager.get_acceptors(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_get_acceptors_filters_by_adapter() {
        let manager = TransportManager::new(
            OrbConfig::default().with_acceptor(AcceptorConfig::tcp(3000)),
        )
        .unwrap();
        manager.install_acceptors().unwrap();
        manager.add_acceptor(Arc::new(TaggedAcceptor::new(3001, 7, "poa-a")));
        manager.add_acceptor(Arc::new(TaggedAcceptor::new(3002, 7, "poa-b")));

        assert_eq!(manager.get_acceptors(None, None).unwrap().len(), 3);
        let matched = manager.get_acceptors(Some(7), Some("poa-b")).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].port(), 3002);
        assert!(manager.get_acceptors(Some(8), Some("poa-b")).unwrap().is_empty());
        assert!(manager.get_acceptors(Some(7), None).unwrap().is_empty());
    }

    #[test]
    fn test_add_to_ior_template() {
        let config = OrbConfig::default()
            .with_acceptor(AcceptorConfig::tcp(2809))
            .with_acceptor(AcceptorConfig::tcp(2810));
        let manager = TransportManager::new(config).unwrap();
        let mut template = IorTemplate::new(GiopVersion::V1_2);
        assert!(manager
            .add_to_ior_template(&mut template, &TemplatePolicies::default(), None, None, None)
            .is_err());

        manager.install_acceptors().unwrap();
        manager
            .add_to_ior_template(
                &mut template,
                &TemplatePolicies::default(),
                Some("http://cb/"),
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            template.addresses().unwrap(),
            vec![IiopAddress::new("127.0.0.1", 2809), IiopAddress::new("127.0.0.1", 2810)]
        );
        assert!(template.has_component(component_tag::ORB_TYPE));
        assert!(template.has_component(component_tag::CODE_SETS));
        assert!(template.has_component(component_tag::JAVA_CODEBASE));
    }

    #[test]
    fn test_start_requires_installed_acceptors_and_close_is_idempotent() {
        let manager =
            TransportManager::new(OrbConfig::default().with_acceptor(AcceptorConfig::tcp(0)))
                .unwrap();
        assert!(manager.start().is_err());
        manager.install_acceptors().unwrap();
        manager.start().unwrap();
        manager.start().unwrap();
        let acceptor = &manager.get_acceptors(None, None).unwrap()[0];
        assert!(acceptor.is_initialized());
        assert_ne!(acceptor.port(), 0);

        manager.close();
        manager.close();
        assert!(manager.is_closed());
        assert!(manager.start().is_err());
    }
}
