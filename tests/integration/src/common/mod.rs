//! Shared helpers for the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use orb_transport::{
    AcceptorConfig, OperationTable, OrbConfig, OrbError, TransportManager,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Install a test log subscriber once. `RUST_LOG` overrides the level.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Operations served by every test server
pub struct TestService {
    pub operations: Arc<OperationTable>,
    pub calls: Arc<AtomicU64>,
}

impl TestService {
    pub fn new() -> Self {
        let operations = Arc::new(OperationTable::new());
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        operations.register("echo", move |body: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(body)
        });

        operations.register("reverse", |body: Bytes| {
            let mut reversed = body.to_vec();
            reversed.reverse();
            Ok(Bytes::from(reversed))
        });

        // body: big-endian milliseconds to sleep, echoed back
        operations.register("sleep", |body: Bytes| {
            let mut millis = [0u8; 8];
            let len = body.len().min(8);
            millis[8 - len..].copy_from_slice(&body[..len]);
            thread::sleep(Duration::from_millis(u64::from_be_bytes(millis)));
            Ok(body)
        });

        operations.register("fail", |_body: Bytes| {
            Err(OrbError::illegal_state("requested failure"))
        });

        Self { operations, calls }
    }
}

/// A started server listening on an ephemeral loopback port
pub struct TestServer {
    pub manager: TransportManager,
    pub addr: SocketAddr,
    pub service: TestService,
}

pub fn start_server(mut config: OrbConfig) -> TestServer {
    if config.acceptors.is_empty() {
        config.acceptors.push(AcceptorConfig::tcp(0));
    }
    let service = TestService::new();
    let manager = TransportManager::builder(config)
        .dispatcher(service.operations.clone())
        .build()
        .expect("server transport");
    manager.install_acceptors().expect("install acceptors");
    manager.start().expect("start acceptors");

    let acceptor = manager.get_acceptors(None, None).expect("acceptors")[0].clone();
    let addr: SocketAddr = format!("{}:{}", acceptor.host(), acceptor.port())
        .parse()
        .expect("acceptor address");
    TestServer {
        manager,
        addr,
        service,
    }
}

pub fn client(config: OrbConfig) -> TransportManager {
    TransportManager::new(config).expect("client transport")
}

pub fn millis(ms: u64) -> Bytes {
    Bytes::copy_from_slice(&ms.to_be_bytes())
}

/// Success/failure counters shared by concurrent test clients
#[derive(Default)]
pub struct ConcurrentStats {
    successes: AtomicU64,
    failures: AtomicU64,
    total_latency_micros: AtomicU64,
    max_latency_micros: AtomicU64,
}

impl ConcurrentStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_latency_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn print_summary(&self, name: &str, elapsed: Duration) {
        let successes = self.successes();
        let average = self.total_latency_micros.load(Ordering::Relaxed) / successes.max(1);
        println!(
            "{}: {} ok, {} failed in {:?} ({:.0} req/s, avg {}us, max {}us)",
            name,
            successes,
            self.failures(),
            elapsed,
            successes as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            average,
            self.max_latency_micros.load(Ordering::Relaxed),
        );
    }
}
