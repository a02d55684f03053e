//! Transport-level properties: per-connection FIFO, connection dedup, write
//! back-pressure, and disconnect/reconnect behavior.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{dest, pick_free_port, read_frame};
use galileo_store::message::RouterEvent;
use galileo_store::router::{ClientMessageRouter, RouterConfig, ServerMessageRouter};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

#[tokio::test]
async fn frames_arrive_in_send_order() {
    let server = ServerMessageRouter::bind(("127.0.0.1", 0), RouterConfig::default())
        .await
        .unwrap();
    server.listen().unwrap();
    let mut events = server.handle().subscribe();
    let destination = dest(server.local_addr().port());

    let client = ClientMessageRouter::new(RouterConfig::default());
    for i in 0..50u32 {
        client
            .send_message(&destination, Bytes::from(format!("frame-{i}")))
            .await
            .unwrap();
    }

    for i in 0..50u32 {
        let event = tokio::time::timeout(common::IO_TIMEOUT, events.recv())
            .await
            .expect("frame in time")
            .expect("listener open");
        let RouterEvent::Message(message) = event else {
            panic!("expected a message, got {event:?}");
        };
        assert_eq!(message.payload, Bytes::from(format!("frame-{i}")));
    }

    client.force_shutdown().await.unwrap();
    server.force_shutdown().await.unwrap();
}

#[tokio::test]
async fn repeated_sends_share_one_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut sink = vec![0u8; 4096];
                while stream.read(&mut sink).await.is_ok_and(|n| n > 0) {}
            });
        }
    });

    let client = ClientMessageRouter::new(RouterConfig::default());
    let destination = dest(port);
    for _ in 0..20 {
        client
            .send_message(&destination, Bytes::from_static(b"ping"))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);

    client.force_shutdown().await.unwrap();
}

#[tokio::test]
async fn full_write_queue_blocks_until_force_shutdown() {
    // A peer that accepts but never reads, so frames pile up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        // Hold the socket open without reading.
        std::future::pending::<()>().await;
        drop(stream);
    });

    let client = ClientMessageRouter::new(RouterConfig {
        max_write_queue_size: 2,
    });
    let destination = dest(port);
    // Large frames so the writer stalls inside the kernel send buffer while
    // holding the first frame, leaving the queue to the rest.
    let payload = Bytes::from(vec![0u8; 4 * 1024 * 1024]);

    for _ in 0..3 {
        tokio::time::timeout(
            Duration::from_secs(2),
            client.send_message(&destination, payload.clone()),
        )
        .await
        .expect("send within queue capacity returns promptly")
        .unwrap();
    }

    // The queue is at capacity: the next send blocks.
    let handle = client.handle().clone();
    let blocked_dest = destination.clone();
    let blocked_payload = payload.clone();
    let blocked = tokio::spawn(async move {
        handle.send_message(&blocked_dest, blocked_payload).await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!blocked.is_finished(), "send on a full queue must block");

    // Force shutdown discards queues and unblocks the stuck sender.
    client.force_shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("blocked send unblocked")
        .expect("task join");
    assert!(result.is_err(), "discarded message reports an error");
}

#[tokio::test]
async fn disconnect_notifies_listeners_and_reconnects_lazily() {
    let port = pick_free_port();
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();

    let client = ClientMessageRouter::new(RouterConfig::default());
    let mut events = client.subscribe();
    let destination = dest(port);

    client
        .send_message(&destination, Bytes::from_static(b"m1"))
        .await
        .unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();
    assert_eq!(read_frame(&mut stream).await.unwrap(), b"m1");

    // Kill the peer: socket closed, listener gone.
    drop(stream);
    drop(listener);

    let event = tokio::time::timeout(common::IO_TIMEOUT, events.recv())
        .await
        .expect("disconnect in time")
        .expect("listener open");
    let RouterEvent::Disconnected {
        destination: dropped,
        ..
    } = event
    else {
        panic!("expected a disconnect, got {event:?}");
    };
    assert_eq!(dropped, Some(destination.clone()));

    // The peer comes back on the same port; the next send reconnects.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    client
        .send_message(&destination, Bytes::from_static(b"m2"))
        .await
        .unwrap();
    let (mut stream, _) = tokio::time::timeout(common::IO_TIMEOUT, listener.accept())
        .await
        .expect("reconnect in time")
        .unwrap();
    assert_eq!(read_frame(&mut stream).await.unwrap(), b"m2");

    client.force_shutdown().await.unwrap();
}
