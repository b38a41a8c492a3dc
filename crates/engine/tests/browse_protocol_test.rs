//! End-to-end anycast browse between two nodes

mod common;

use common::{TestMesh, fast_config, host_partition, payload};
use meshq_engine::ErrorKind;
use meshq_engine::foundation::types::DestinationName;
use meshq_engine::services::anycast::RemoteConsumerAccess;
use std::time::Duration;

#[tokio::test]
async fn browse_pulls_every_message_then_ends() {
    let mesh = TestMesh::new();
    let requester = mesh.start_node(fast_config()).await;
    let host = mesh.start_node(fast_config()).await;
    host_partition(&host, "orders", &["a", "b", "c"]);
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        None,
    );

    let mut got = Vec::new();
    while let Some(message) = cursor.next().await.unwrap() {
        got.push(payload(message));
    }
    assert_eq!(got, vec!["a", "b", "c"]);

    // End of data closed the hosting-side session and the cursor is sticky
    assert!(host.engine.anycast().sessions().is_empty());
    assert!(cursor.next().await.unwrap().is_none());

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}

#[tokio::test]
async fn filtered_browse_only_sees_matching_messages() {
    let mesh = TestMesh::new();
    let requester = mesh.start_node(fast_config()).await;
    let host = mesh.start_node(fast_config()).await;

    let partition = host_partition(&host, "orders", &[]);
    partition.enqueue(meshq_engine::foundation::types::QueuedMessage::with_property(
        b"red-1".as_slice(),
        "color",
        "red",
    ));
    partition.enqueue(meshq_engine::foundation::types::QueuedMessage::new(
        b"plain".as_slice(),
    ));
    partition.enqueue(meshq_engine::foundation::types::QueuedMessage::with_property(
        b"red-2".as_slice(),
        "color",
        "red",
    ));
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        Some("color=red".to_string()),
    );

    let mut got = Vec::new();
    while let Some(message) = cursor.next().await.unwrap() {
        got.push(payload(message));
    }
    assert_eq!(got, vec!["red-1", "red-2"]);

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_filter_is_rejected_with_a_distinct_reason() {
    let mesh = TestMesh::new();
    let requester = mesh.start_node(fast_config()).await;
    let host = mesh.start_node(fast_config()).await;
    host_partition(&host, "orders", &["a"]);
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        Some("no equals sign".to_string()),
    );

    let err = cursor.next().await.unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::InvalidFilter);

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}

#[tokio::test]
async fn keep_alive_pings_preserve_an_idle_browse() {
    let mesh = TestMesh::new();
    // Requester pings every 100ms, hosting side reaps after 400ms idle
    let requester = mesh.start_node(fast_config()).await;
    let host = mesh.start_node(fast_config()).await;
    host_partition(&host, "orders", &["a", "b"]);
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        None,
    );
    assert_eq!(payload(cursor.next().await.unwrap().unwrap()), "a");

    // Idle for several expiry periods; the pings keep the session alive
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(host.engine.anycast().sessions().len(), 1);
    assert_eq!(payload(cursor.next().await.unwrap().unwrap()), "b");

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}

#[tokio::test]
async fn reaped_session_rejects_a_resumed_browse() {
    let mesh = TestMesh::new();
    // Requester pings far less often than the hosting side reaps
    let mut requester_config = fast_config();
    requester_config.anycast.liveness_interval = Duration::from_secs(30);
    let requester = mesh.start_node(requester_config).await;
    let host = mesh.start_node(fast_config()).await;
    host_partition(&host, "orders", &["a", "b"]);
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        None,
    );
    assert_eq!(payload(cursor.next().await.unwrap().unwrap()), "a");

    // No activity and no pings: the hosting side reaps the session
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert!(host.engine.anycast().sessions().is_empty());

    // The next get resumes mid-sequence and must be rejected, not recreated
    let err = cursor.next().await.unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Protocol);
    assert!(host.engine.anycast().sessions().is_empty());

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}

#[tokio::test]
async fn explicit_finish_closes_the_hosting_session() {
    let mesh = TestMesh::new();
    let requester = mesh.start_node(fast_config()).await;
    let host = mesh.start_node(fast_config()).await;
    host_partition(&host, "orders", &["a", "b", "c"]);
    requester.refresh_topology().await;

    let cursor = requester.engine.anycast().open_browse(
        host.node_id.clone(),
        DestinationName::from("orders"),
        None,
        None,
    );
    assert!(cursor.next().await.unwrap().is_some());
    assert_eq!(host.engine.anycast().sessions().len(), 1);

    requester
        .engine
        .anycast()
        .finish_browse(cursor.browse_id())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(host.engine.anycast().sessions().is_empty());

    requester.engine.stop().await.unwrap();
    host.engine.stop().await.unwrap();
}
