//! Transport Tests - Request Correlation, Negotiation and Teardown
//!
//! These tests run a client and a server transport manager over loopback:
//! - Many concurrent requests multiplexed over one connection
//! - GIOP version negotiation, including legacy peers
//! - Service context exchange on the first request
//! - Pending requests purged on close and abort

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use common::*;
use orb_transport::ior::component_tag;
use orb_transport::service_context::code_set;
use orb_transport::{
    CompletionStatus, ConnectionState, ErrorKind, GiopVersion, IorTemplate, OrbConfig, OrbVersion,
    ReaderMode, ReplyStatus, TemplatePolicies,
};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn test_concurrent_requests_are_correlated() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let handles: Vec<_> = (0..16u32)
        .map(|t| {
            let conn = conn.clone();
            thread::spawn(move || {
                for i in 0..10u32 {
                    let payload = format!("thread-{}-call-{}", t, i);
                    let reply = conn
                        .send_request("reverse", Bytes::from(payload.clone()), true, WAIT)
                        .unwrap()
                        .unwrap();
                    let expected: String = payload.chars().rev().collect();
                    assert_eq!(reply.status, ReplyStatus::NoException);
                    assert_eq!(&reply.body[..], expected.as_bytes());
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(conn.pending_request_count(), 0);
    assert_eq!(client.stats().snapshot().outbound_connections_opened, 1);
    assert_eq!(server.manager.stats().snapshot().connections_accepted, 1);
}

#[test]
fn test_outbound_connections_are_reused() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let first = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    let second = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(client.stats().snapshot().outbound_connections_reused, 1);
}

#[test]
fn test_reused_connection_keeps_its_negotiated_version() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let first = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    let second = client
        .get_outbound_connection(server.addr, GiopVersion::V1_1, None)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.giop_version(), GiopVersion::V1_2);
    assert_eq!(second.preferred_request_version(GiopVersion::V1_1, None), GiopVersion::V1_1);

    let reply = second
        .send_request("echo", Bytes::from_static(b"same"), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(&reply.body[..], b"same");
}

#[test]
fn test_version_negotiation_with_older_peer() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_1, Some(OrbVersion::FOREIGN))
        .unwrap();
    assert_eq!(conn.giop_version(), GiopVersion::V1_1);

    conn.send_request("echo", Bytes::from_static(b"v"), true, WAIT)
        .unwrap()
        .unwrap();
    let accepted = server.manager.connections();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].giop_version(), GiopVersion::V1_1);
}

#[test]
fn test_legacy_peer_gets_giop_1_0() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, Some(OrbVersion::OLD))
        .unwrap();
    assert_eq!(conn.giop_version(), GiopVersion::V1_0);

    let reply = conn
        .send_request("echo", Bytes::from_static(b"legacy"), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(&reply.body[..], b"legacy");
}

#[test]
fn test_first_request_carries_code_sets_and_codebase() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let mut config = OrbConfig::default();
    config.codebase = Some("IOR:0000cafe".to_string());
    config.char_codeset = code_set::UTF_8;
    let client = client(config);
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    conn.send_request("echo", Bytes::new(), true, WAIT).unwrap();
    conn.send_request("echo", Bytes::new(), true, WAIT).unwrap();

    let accepted = server.manager.connections();
    let server_conn = &accepted[0];
    assert_eq!(server_conn.state(), ConnectionState::Established);
    let negotiated = server_conn.code_set().unwrap();
    assert_eq!(negotiated.char_data(), code_set::UTF_8);
    assert_eq!(negotiated.wchar_data(), code_set::UTF_16);
    assert_eq!(server_conn.code_base_ior().as_deref(), Some("IOR:0000cafe"));
    assert_eq!(server_conn.peer_orb_version(), Some(OrbVersion::PEORB));
    assert_eq!(conn.code_set(), Some(negotiated));
}

#[test]
fn test_operation_failures_become_system_exceptions() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let reply = conn
        .send_request("no-such-operation", Bytes::new(), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::SystemException);

    let reply = conn
        .send_request("fail", Bytes::new(), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(reply.status, ReplyStatus::SystemException);
    assert!(String::from_utf8_lossy(&reply.body).contains("requested failure"));

    // the connection survives both
    conn.send_request("echo", Bytes::new(), true, WAIT)
        .unwrap()
        .unwrap();
}

#[test]
fn test_oneway_requests() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    for _ in 0..5 {
        assert!(conn
            .send_request("echo", Bytes::new(), false, WAIT)
            .unwrap()
            .is_none());
    }
    let calls = server.service.calls.clone();
    assert!(wait_until(WAIT, || calls.load(std::sync::atomic::Ordering::SeqCst) == 5));
}

#[test]
fn test_timeout_cancels_and_keeps_connection() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let err = conn
        .send_request("sleep", millis(300), true, Duration::from_millis(50))
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.completion(), CompletionStatus::Maybe);
    assert!(err.is_retryable());

    let reply = conn
        .send_request("echo", Bytes::from_static(b"still alive"), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(&reply.body[..], b"still alive");
    assert!(conn.is_established());
}

#[test]
fn test_server_close_purges_pending_requests() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let waiter = {
        let conn = conn.clone();
        thread::spawn(move || conn.send_request("sleep", millis(500), true, WAIT))
    };
    assert!(wait_until(WAIT, || conn.pending_request_count() == 1));

    let server_manager = server.manager;
    let closer = thread::spawn(move || server_manager.close());

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::CommFailure(_)), "{}", err);
    assert_eq!(err.completion(), CompletionStatus::NotCompleted);
    assert!(wait_until(WAIT, || conn.state() == ConnectionState::CloseReceived));
    closer.join().unwrap();

    let err = conn
        .send_request("echo", Bytes::new(), true, WAIT)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Closed));
}

#[test]
fn test_abort_purges_and_next_lookup_reconnects() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let conn = conn.clone();
            thread::spawn(move || conn.send_request("sleep", millis(500), true, WAIT))
        })
        .collect();
    assert!(wait_until(WAIT, || conn.pending_request_count() == 3));

    conn.abort("test abort");
    assert_eq!(conn.state(), ConnectionState::Abort);
    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CommFailure(_)));
        assert_eq!(err.completion(), CompletionStatus::Maybe);
    }

    let fresh = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    assert!(!Arc::ptr_eq(&conn, &fresh));
    fresh
        .send_request("echo", Bytes::new(), true, WAIT)
        .unwrap()
        .unwrap();
    assert_eq!(client.stats().snapshot().outbound_connections_opened, 2);
}

#[test]
fn test_oversized_message_aborts_connection() {
    init_logging();
    let mut server_config = OrbConfig::default();
    server_config.max_message_size = 256;
    let server = start_server(server_config);
    let client = client(OrbConfig::default());
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();

    let err = conn
        .send_request("echo", Bytes::from(vec![7u8; 4096]), true, WAIT)
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::CommFailure(_)), "{}", err);
    assert!(wait_until(WAIT, || !conn.state().is_open()));
}

#[test]
fn test_pooled_reader_mode_end_to_end() {
    init_logging();
    let mut config = OrbConfig::default();
    config.reader_mode = ReaderMode::Pooled;
    config.thread_pool.max_threads = 8;
    let server = start_server(config.clone());
    let client = client(config);
    let conn = client
        .get_outbound_connection(server.addr, GiopVersion::V1_2, None)
        .unwrap();
    assert_eq!(conn.reader_mode(), ReaderMode::Pooled);

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let conn = conn.clone();
            thread::spawn(move || {
                for i in 0..10u8 {
                    let reply = conn
                        .send_request("echo", Bytes::from(vec![t, i]), true, WAIT)
                        .unwrap()
                        .unwrap();
                    assert_eq!(&reply.body[..], &[t, i]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_pooled_connections_outnumber_pool_workers() {
    init_logging();
    let mut config = OrbConfig::default();
    config.reader_mode = ReaderMode::Pooled;
    config.thread_pool.min_threads = 1;
    config.thread_pool.max_threads = 1;
    let server = start_server(config);

    let clients: Vec<_> = (0..3).map(|_| client(OrbConfig::default())).collect();
    let conns: Vec<_> = clients
        .iter()
        .map(|c| c.get_outbound_connection(server.addr, GiopVersion::V1_2, None).unwrap())
        .collect();
    for round in 0..3u8 {
        for (i, conn) in conns.iter().enumerate() {
            let payload = Bytes::from(vec![round, i as u8]);
            let reply = conn.send_request("echo", payload.clone(), true, WAIT).unwrap().unwrap();
            assert_eq!(reply.body, payload);
        }
    }
    assert_eq!(server.manager.stats().snapshot().connections_accepted, 3);
}

#[test]
fn test_ior_template_lists_started_acceptors() {
    init_logging();
    let server = start_server(OrbConfig::default());
    let mut template = IorTemplate::new(GiopVersion::V1_2);
    server
        .manager
        .add_to_ior_template(&mut template, &TemplatePolicies::default(), None, None, None)
        .unwrap();
    let primary = template.primary_address().unwrap();
    assert_eq!(primary.port, server.addr.port());
    assert!(template.has_component(component_tag::CODE_SETS));
    assert!(!template.has_component(component_tag::JAVA_CODEBASE));
}

#[test]
fn test_idle_connections_are_reclaimed() {
    init_logging();
    let first_server = start_server(OrbConfig::default());
    let second_server = start_server(OrbConfig::default());
    let mut config = OrbConfig::default();
    config.cache_high_water_mark = 1;
    config.cache_reclaim_count = 1;
    let client = client(config);

    let first = client
        .get_outbound_connection(first_server.addr, GiopVersion::V1_2, None)
        .unwrap();
    thread::sleep(Duration::from_millis(5));
    let second = client
        .get_outbound_connection(second_server.addr, GiopVersion::V1_2, None)
        .unwrap();

    assert!(!first.state().is_open());
    assert!(second.state().is_open());
    assert_eq!(client.stats().snapshot().connections_reclaimed, 1);
    assert_eq!(client.cache_stats().outbound, 1);
}
