//! Server pipeline behavior under load: idle reclamation and backpressure.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;

use tern_codec::I64Codec;
use tern_core::{CallContext, DispatchError};
use tern_transport::{Client, ClientConfig, Server, ServerConfig};

use support::{init_tracing, value, wait_until, Gate};

#[test]
fn test_idle_connections_closed_in_batches() {
    init_tracing();
    let max_idle = Duration::from_millis(300);
    let scan_interval = max_idle * 3 / 4;
    let kill_max = 3;
    let clients = 1 + kill_max * 2; // one stays busy, two batches to reclaim

    let first_gate = Gate::new();
    let rest_gate = Gate::new();
    let arrivals = Arc::new(AtomicUsize::new(0));
    let server = Server::bind(
        ServerConfig::default()
            .handler_count(clients)
            .max_idle(max_idle)
            .idle_scan_interval(scan_interval)
            .idle_threshold(0)
            .kill_max(kill_max),
        I64Codec,
        I64Codec,
        {
            let (first_gate, rest_gate, arrivals) = (first_gate.clone(), rest_gate.clone(), arrivals.clone());
            move |_: &CallContext, value: i64| -> Result<i64, DispatchError> {
                if arrivals.fetch_add(1, Ordering::SeqCst) == 0 {
                    first_gate.wait();
                } else {
                    rest_gate.wait();
                }
                Ok(value)
            }
        },
    )
    .unwrap();
    server.start().unwrap();
    let addr = server.local_addr();

    let client_config = ClientConfig::default().max_idle(Duration::from_secs(30));
    let callers: Vec<_> = (0..clients)
        .map(|_| Client::new(client_config.clone(), I64Codec, I64Codec))
        .collect();
    let (returned_tx, returned_rx) = channel::unbounded();

    thread::scope(|s| {
        for (i, client) in callers.iter().enumerate() {
            let returned_tx = returned_tx.clone();
            s.spawn(move || {
                let result = client.call(&value(i, 0), addr, None, None, Duration::ZERO);
                returned_tx.send(result.is_ok()).unwrap();
            });
        }

        // Every call is parked in a handler, so every connection is open.
        assert!(wait_until(Duration::from_secs(5), || arrivals.load(Ordering::SeqCst) == clients));
        assert_eq!(server.num_open_connections(), clients);

        // Replies alone close nothing.
        rest_gate.open();
        for _ in 1..clients {
            assert!(returned_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(server.num_open_connections(), clients);

        // Reclamation happens at most `kill_max` per scan and spares the busy one.
        let mut last = clients;
        assert!(wait_until(Duration::from_secs(10), || {
            let open = server.num_open_connections();
            assert!(last - open <= kill_max, "closed {} in one scan", last - open);
            last = open;
            open == 1
        }));
        thread::sleep(scan_interval * 2);
        assert_eq!(server.num_open_connections(), 1);

        // Once its call completes the last one goes too.
        first_gate.open();
        assert!(returned_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(wait_until(Duration::from_secs(10), || server.num_open_connections() == 0));
    });

    server.stop();
}

/// Jam the single handler, fill the call queue, block every reader, and
/// check that the listener stops accepting once reader queues are full.
fn check_blocking(readers: usize, reader_queue: usize, call_queue: usize) {
    let handlers = 1;
    let initial_clients = readers + call_queue + handlers;
    // The extra one is held by the listener while it waits on a full queue.
    let max_accept = initial_clients + readers * reader_queue + 1;
    let clients = max_accept * 2;

    let gate = Gate::new();
    let (arrived_tx, arrived_rx) = channel::unbounded();
    let server = Server::bind(
        ServerConfig::default()
            .handler_count(handlers)
            .reader_count(readers)
            .reader_queue_size(reader_queue)
            .call_queue_size(call_queue),
        I64Codec,
        I64Codec,
        {
            let gate = gate.clone();
            move |_: &CallContext, value: i64| -> Result<i64, DispatchError> {
                let _ = arrived_tx.send(());
                gate.wait();
                Ok(value)
            }
        },
    )
    .unwrap();
    server.start().unwrap();
    let addr = server.local_addr();

    let failures = AtomicUsize::new(0);
    let finished = AtomicUsize::new(0);

    thread::scope(|s| {
        let spawn_caller = |i: usize| {
            let (failures, finished) = (&failures, &finished);
            s.spawn(move || {
                let client = Client::new(ClientConfig::default(), I64Codec, I64Codec);
                if let Err(e) = client.call(&value(i, 0), addr, None, None, Duration::from_secs(60)) {
                    tracing::error!(error = %e, "Call failed");
                    failures.fetch_add(1, Ordering::SeqCst);
                }
                finished.fetch_add(1, Ordering::SeqCst);
                client.stop();
            });
        };

        // Slot the first callers in one at a time so each stage fills in order.
        for i in 0..initial_clients {
            spawn_caller(i);
            if i == 0 {
                arrived_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            } else if i <= call_queue {
                assert!(wait_until(Duration::from_secs(5), || server.call_queue_len() == i));
            }
        }
        assert!(wait_until(Duration::from_secs(5), || {
            server.num_open_connections() == initial_clients
        }));
        // Let the last readers pick up their calls and block on the full queue.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(server.call_queue_len(), call_queue);

        // Flood: reader queues fill, then the listener blocks.
        for i in initial_clients..clients {
            spawn_caller(i);
        }
        assert!(wait_until(Duration::from_secs(5), || {
            server.num_open_connections() >= max_accept
        }));
        for _ in 0..4 {
            assert_eq!(server.num_open_connections(), max_accept);
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        gate.open();
    });

    assert_eq!(finished.load(Ordering::SeqCst), clients);
    assert_eq!(failures.load(Ordering::SeqCst), 0);
    server.stop();
}

#[test]
fn test_reader_queuing_applies_backpressure() {
    init_tracing();
    for _ in 0..3 {
        check_blocking(1, 1, 1);
    }
    for _ in 0..3 {
        check_blocking(4, 5, 2);
    }
}
