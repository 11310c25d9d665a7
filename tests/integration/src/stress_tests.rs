//! Stress Tests - Many Clients, Shared Connections and Connection Churn
//!
//! These tests look for races in the transport by:
//! - Running many client transports against a single server
//! - Sharing each client connection between several threads
//! - Serving more pooled connections than the pool has workers
//! - Opening and dropping connections repeatedly
//! - Checking data integrity of every reply

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use common::*;
use orb_transport::{GiopVersion, OrbConfig, ReaderMode, ReplyStatus};

const WAIT: Duration = Duration::from_secs(10);

fn run_clients(server: &TestServer, clients: usize, threads_per_client: usize, requests: usize) -> Arc<ConcurrentStats> {
    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(clients * threads_per_client));
    let mut handles = Vec::new();

    for client_id in 0..clients {
        let manager = Arc::new(client(OrbConfig::default()));
        let conn = manager
            .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
            .unwrap();
        for thread_id in 0..threads_per_client {
            let conn = conn.clone();
            let manager = manager.clone();
            let stats = stats.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let _manager = manager;
                barrier.wait();
                for request in 0..requests {
                    let payload = Bytes::from(format!("client_{}_thread_{}_request_{}", client_id, thread_id, request));
                    let start = Instant::now();
                    match conn.send_request("echo", payload.clone(), true, WAIT) {
                        Ok(Some(reply)) if reply.status == ReplyStatus::NoException && reply.body == payload => {
                            stats.record_success(start.elapsed())
                        }
                        Ok(other) => {
                            eprintln!("Unexpected reply for client {} thread {}: {:?}", client_id, thread_id, other);
                            stats.record_failure();
                        }
                        Err(e) => {
                            eprintln!("Client {} thread {} request {} failed: {}", client_id, thread_id, request, e);
                            stats.record_failure();
                        }
                    }
                }
            }));
        }
    }

    for handle in handles {
        handle.join().unwrap();
    }
    stats
}

#[test]
fn test_many_clients_sharing_connections() {
    init_logging();
    const CLIENTS: usize = 8;
    const THREADS: usize = 4;
    const REQUESTS: usize = 50;

    let server = start_server(OrbConfig::default());
    let start = Instant::now();
    let stats = run_clients(&server, CLIENTS, THREADS, REQUESTS);
    stats.print_summary("many clients", start.elapsed());

    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.successes(), (CLIENTS * THREADS * REQUESTS) as u64);
    assert_eq!(server.manager.stats().snapshot().connections_accepted, CLIENTS as u64);
}

#[test]
fn test_pooled_readers_under_load() {
    init_logging();
    let mut config = OrbConfig::default();
    config.reader_mode = ReaderMode::Pooled;
    config.thread_pool.max_threads = 16;
    let server = start_server(config);

    let start = Instant::now();
    let stats = run_clients(&server, 4, 4, 50);
    stats.print_summary("pooled readers", start.elapsed());

    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.successes(), 4 * 4 * 50);
}

#[test]
fn test_pooled_readers_outnumber_workers_under_load() {
    init_logging();
    let mut config = OrbConfig::default();
    config.reader_mode = ReaderMode::Pooled;
    config.thread_pool.min_threads = 1;
    config.thread_pool.max_threads = 2;
    let server = start_server(config);

    let start = Instant::now();
    let stats = run_clients(&server, 6, 2, 20);
    stats.print_summary("pooled readers, two workers", start.elapsed());

    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.successes(), 6 * 2 * 20);
    assert_eq!(server.manager.stats().snapshot().connections_accepted, 6);
}

#[test]
fn test_connection_churn() {
    init_logging();
    let server = start_server(OrbConfig::default());

    for round in 0..20 {
        let manager = client(OrbConfig::default());
        let conn = manager
            .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
            .unwrap();
        let payload = Bytes::from(format!("round-{}", round));
        let reply = conn.send_request("echo", payload.clone(), true, WAIT).unwrap().unwrap();
        assert_eq!(reply.body, payload);
        manager.close();
        assert!(!conn.state().is_open());
    }

    assert_eq!(server.manager.stats().snapshot().connections_accepted, 20);
    // every client said goodbye, so the server forgets all of them
    assert!(wait_until(WAIT, || {
        server.manager.reclaim();
        server.manager.cache_stats().inbound == 0
    }));
}

#[test]
fn test_aborts_under_load_fail_only_pending_requests() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let manager = client(OrbConfig::default());
    let conn = manager
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let stats = Arc::new(ConcurrentStats::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            let stats = stats.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    let start = Instant::now();
                    match conn.send_request("echo", Bytes::from_static(b"x"), true, WAIT) {
                        Ok(_) => stats.record_success(start.elapsed()),
                        Err(_) => stats.record_failure(),
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    conn.abort("stress abort");
    for handle in handles {
        handle.join().unwrap();
    }

    // nothing hangs, and every request either completed or failed
    assert_eq!(stats.successes() + stats.failures(), 8 * 200);
    assert_eq!(conn.pending_request_count(), 0);

    let fresh = manager
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    fresh.send_request("echo", Bytes::new(), true, WAIT).unwrap();
}
