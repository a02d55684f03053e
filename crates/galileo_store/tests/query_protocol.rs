//! End-to-end query protocol tests: preamble ordering, fan-out completion,
//! and id assignment across a small in-process overlay.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{cleanup_dir, dest, pick_free_port, start_node, test_dir, wait_for_gblocks, TestClient};
use galileo_store::dataset::{Block, Metadata};
use galileo_store::events::{Event, QueryRequest, QueryResponse, StorageEvent};

const QUERY: &str = "temperature<300";

#[tokio::test]
async fn single_peer_query_round_trip() {
    let dir = test_dir("query-roundtrip");
    let port_a = pick_free_port();
    let port_b = pick_free_port();
    let overlay = [(1u32, port_a), (1u32, port_b)];

    let node_a = start_node(&dir.join("a"), port_a, &overlay, Duration::from_secs(30)).await;
    let node_b = start_node(&dir.join("b"), port_b, &overlay, Duration::from_secs(30)).await;

    // Seed node B with a matching block; storage has no ack, so wait for the
    // file to land before querying.
    let mut client = TestClient::new();
    let block = Block::new(
        Metadata::new("sensor-b").with_feature("temperature", 281.5),
        Bytes::from_static(b"reading"),
    );
    client
        .send(&dest(port_b), &Event::Storage(StorageEvent { block }))
        .await;
    wait_for_gblocks(&node_b.storage_dir(), 1, common::IO_TIMEOUT).await;

    client
        .send(
            &dest(port_a),
            &Event::QueryRequest(QueryRequest {
                query: QUERY.into(),
            }),
        )
        .await;

    // The preamble always precedes any response on the client connection.
    let first = client
        .next_event(common::IO_TIMEOUT)
        .await
        .expect("preamble");
    let Event::QueryPreamble(preamble) = first else {
        panic!("expected a preamble first, got {first:?}");
    };
    assert_eq!(preamble.query_id, format!("127.0.0.1-{port_a}:0"));
    assert_eq!(preamble.query, QUERY);
    assert_eq!(preamble.nodes.len(), 2);

    let mut total_results = 0;
    for _ in 0..2 {
        let event = client
            .next_event(common::IO_TIMEOUT)
            .await
            .expect("query response");
        let Event::QueryResponse(response) = event else {
            panic!("expected a response, got {event:?}");
        };
        assert_eq!(response.query_id, preamble.query_id);
        total_results += response.results.len();
    }
    assert_eq!(total_results, 1, "only node B holds a matching block");

    // The session counter is monotonic across requests.
    client
        .send(
            &dest(port_a),
            &Event::QueryRequest(QueryRequest {
                query: QUERY.into(),
            }),
        )
        .await;
    let event = client
        .next_event(common::IO_TIMEOUT)
        .await
        .expect("second preamble");
    let Event::QueryPreamble(second) = event else {
        panic!("expected a preamble, got {event:?}");
    };
    assert_eq!(second.query_id, format!("127.0.0.1-{port_a}:1"));

    client.shutdown().await;
    node_a.shutdown().await;
    node_b.shutdown().await;
    cleanup_dir(&dir);
}

#[tokio::test]
async fn fan_out_collects_a_response_from_every_peer() {
    let dir = test_dir("query-fanout");
    let ports: Vec<u16> = (0..4).map(|_| pick_free_port()).collect();
    let overlay: Vec<(u32, u16)> = ports.iter().map(|p| (1u32, *p)).collect();

    let mut nodes = Vec::new();
    for (i, port) in ports.iter().enumerate() {
        nodes.push(
            start_node(
                &dir.join(format!("n{i}")),
                *port,
                &overlay,
                Duration::from_secs(30),
            )
            .await,
        );
    }

    let mut client = TestClient::new();
    client
        .send(
            &dest(ports[0]),
            &Event::QueryRequest(QueryRequest {
                query: QUERY.into(),
            }),
        )
        .await;

    let event = client
        .next_event(common::IO_TIMEOUT)
        .await
        .expect("preamble");
    let Event::QueryPreamble(preamble) = event else {
        panic!("expected a preamble, got {event:?}");
    };
    assert_eq!(preamble.nodes.len(), 4);

    // Responses are forwarded in arrival order; all four peers answer.
    for _ in 0..4 {
        let event = client
            .next_event(common::IO_TIMEOUT)
            .await
            .expect("query response");
        let Event::QueryResponse(response) = event else {
            panic!("expected a response, got {event:?}");
        };
        assert_eq!(response.query_id, preamble.query_id);
    }

    // The tracker closed on completion: a forged late response for the same
    // id is dropped, not forwarded back to us.
    client
        .send(
            &dest(ports[0]),
            &Event::QueryResponse(QueryResponse {
                query_id: preamble.query_id.clone(),
                results: Vec::new(),
            }),
        )
        .await;
    assert!(
        client.next_event(Duration::from_millis(500)).await.is_none(),
        "closed tracker must drop late responses"
    );

    client.shutdown().await;
    for node in nodes {
        node.shutdown().await;
    }
    cleanup_dir(&dir);
}
