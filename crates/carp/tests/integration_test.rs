//! Raw socket integration tests
//!
//! These tests require CAP_NET_RAW.
//! Run with: sudo -E CARP_TEST_ENABLED=1 cargo test --test integration_test

use carp::runtime::pump;
use carp::{CarpOptions, CarpRequest, CarpRuntime, Family, ParentInterface, Privilege, SocketTransport, VhostState};
use std::env;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

fn integration_tests_enabled() -> bool {
    env::var("CARP_TEST_ENABLED").is_ok()
}

fn open_loopback() -> Option<(u32, Vec<carp::CarpSocket>, SocketTransport)> {
    let mut transport = SocketTransport::new();
    match transport.open("lo") {
        Ok((index, receivers)) => Some((index, receivers, transport)),
        Err(e) => {
            eprintln!("Failed to open CARP sockets: {}", e);
            eprintln!("Make sure to run with CAP_NET_RAW: sudo -E cargo test");
            None
        }
    }
}

#[tokio::test]
async fn test_open_sockets_on_loopback() {
    if !integration_tests_enabled() {
        println!("Skipping integration test (set CARP_TEST_ENABLED=1 to run)");
        return;
    }
    let Some((index, receivers, _transport)) = open_loopback() else {
        return;
    };

    assert!(index > 0);
    assert!(receivers.iter().any(|s| s.family() == Family::V4));
    assert!(receivers.iter().all(|s| s.interface() == "lo"));
}

#[tokio::test]
async fn test_single_node_becomes_master_and_advertises() {
    if !integration_tests_enabled() {
        println!("Skipping integration test (set CARP_TEST_ENABLED=1 to run)");
        return;
    }
    let Some((index, receivers, transport)) = open_loopback() else {
        return;
    };

    let runtime = CarpRuntime::new(CarpOptions::default(), transport);
    let engine = runtime.engine();
    {
        let mut engine = engine.lock().await;
        let mut lo = ParentInterface::ethernet("lo", index, [2, 0, 0, 0, 0, 1]);
        lo.simplex = false;
        engine.register_interface(lo).unwrap();
        engine.create_coordinator("carp0").unwrap();
        let req = CarpRequest::new().carpdev("lo").vhid(200, 0).advbase(0).passphrase("it");
        engine.set_request("carp0", &req, Privilege::Privileged).unwrap();
        engine.add_address("carp0", "127.0.1.1".parse().unwrap()).unwrap();
    }

    for socket in receivers {
        tokio::spawn(pump(socket, runtime.inbound()));
    }
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(runtime.run(async {
        let _ = stop_rx.await;
    }));

    sleep(Duration::from_millis(500)).await;
    {
        let engine = engine.lock().await;
        assert_eq!(engine.state_of("carp0", 200), Some(VhostState::Master));
        assert!(engine.stats().snapshot().opackets >= 1);
    }

    stop_tx.send(()).unwrap();
    task.await.unwrap();
}
