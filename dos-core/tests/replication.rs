mod common;

use common::{attach_node, lease_endpoint, namenode};
use dos_core::datanode::LeaseEvent;
use dos_core::{DosError, LocalStore, NameNode, NameNodeOptions, NodeFrame, Outbound, SqliteStore};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_creates_land_on_exactly_r_distinct_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(2);
    let mut nodes = Vec::new();
    for id in ["n1", "n2", "n3"] {
        nodes.push(attach_node(&namenode, id, dir.path()).await);
    }
    let registered: BTreeSet<String> = nodes.iter().map(|node| node.id.clone()).collect();

    let names: Vec<String> = (0..5).map(|i| format!("object-{}", i)).collect();
    for name in &names {
        let outcome = namenode.create_object(name, name.as_bytes()).await.unwrap();
        assert_eq!(outcome.holders.len(), 2);
        assert_eq!(outcome.commit.acked.len(), 3);
    }

    assert_eq!(namenode.status().await.objects, 5);
    for name in &names {
        let holders = namenode.holders_of(name).await.unwrap();
        let distinct: BTreeSet<String> = holders.iter().cloned().collect();
        assert_eq!(distinct.len(), 2);
        assert!(distinct.is_subset(&registered));

        for node in &nodes {
            let stored = node.store.get(name).unwrap();
            assert_eq!(stored.is_some(), distinct.contains(&node.id));
        }
    }
}

#[tokio::test]
async fn test_duplicate_create_fails_and_leaves_directory_alone() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(1);
    let _node = attach_node(&namenode, "n1", dir.path()).await;

    namenode.create_object("x", b"first").await.unwrap();
    let sequence = namenode.sequence();
    let holders = namenode.holders_of("x").await.unwrap();

    let second = namenode.create_object("x", b"second").await;
    assert!(matches!(second, Err(DosError::ObjectAlreadyExists(_))));
    assert_eq!(namenode.holders_of("x").await.unwrap(), holders);
    assert_eq!(namenode.status().await.objects, 1);
    assert_eq!(namenode.sequence(), sequence);
}

#[tokio::test]
async fn test_create_needs_enough_registered_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(3);
    let _n1 = attach_node(&namenode, "n1", dir.path()).await;
    let _n2 = attach_node(&namenode, "n2", dir.path()).await;

    let result = namenode.create_object("x", b"data").await;
    assert!(matches!(
        result,
        Err(DosError::NotEnoughReplicas {
            required: 3,
            found: 2
        })
    ));
    assert!(!namenode.exists("x").await);
    assert_eq!(namenode.status().await.nodes, 2);
}

#[tokio::test]
async fn test_sequence_advances_once_per_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(1);
    let n1 = attach_node(&namenode, "n1", dir.path()).await;
    let n2 = attach_node(&namenode, "n2", dir.path()).await;

    assert_eq!(namenode.sequence(), 0);
    let outcome = namenode.create_object("o", b"v1").await.unwrap();
    assert_eq!(outcome.commit.sequence, 1);
    assert_eq!(namenode.sequence(), 1);

    let update = namenode.update_object("o", b"v2").await.unwrap();
    assert_eq!(update.sequence, 2);
    assert_eq!(update.acked.len(), 2);

    let delete = namenode.delete_object("o").await.unwrap();
    assert_eq!(delete.sequence, 3);
    assert_eq!(namenode.sequence(), 3);
    assert!(!namenode.exists("o").await);

    let holder = if outcome.holders[0] == n1.id { &n1 } else { &n2 };
    let events: Vec<LeaseEvent> = holder.lease.published().iter().map(|n| n.event).collect();
    assert_eq!(
        events,
        vec![LeaseEvent::Create, LeaseEvent::Update, LeaseEvent::Delete]
    );
    assert!(holder.store.get("o").unwrap().is_none());
}

#[tokio::test]
async fn test_update_and_delete_require_existing_object() {
    let namenode = namenode(1);

    assert!(matches!(
        namenode.update_object("missing", b"x").await,
        Err(DosError::ObjectNotFound(_))
    ));
    assert!(matches!(
        namenode.delete_object("missing").await,
        Err(DosError::ObjectNotFound(_))
    ));
    assert_eq!(namenode.sequence(), 0);
}

#[tokio::test]
async fn test_lease_returns_holder_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(2);
    let mut nodes = Vec::new();
    for id in ["n1", "n2", "n3"] {
        nodes.push(attach_node(&namenode, id, dir.path()).await);
    }

    assert!(matches!(
        namenode.lease_object("nope").await,
        Err(DosError::ObjectNotFound(_))
    ));

    let outcome = namenode.create_object("o", b"data").await.unwrap();
    let mut expected: Vec<String> = outcome.holders.iter().map(|id| lease_endpoint(id)).collect();
    expected.sort();
    let mut endpoints = namenode.lease_object("o").await.unwrap();
    endpoints.sort();
    assert_eq!(endpoints, expected);
}

#[tokio::test]
async fn test_silent_node_times_out_create_round() {
    let namenode = Arc::new(
        NameNode::new(NameNodeOptions {
            replication: 1,
            create_ack_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .unwrap(),
    );

    // Registers but never acks anything.
    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let (outbound_tx, mut outbound_rx) = mpsc::channel(8);
    inbound_tx
        .send(NodeFrame::beat("mute", "ws://mute", 0, Vec::new()))
        .await
        .unwrap();
    tokio::spawn({
        let namenode = namenode.clone();
        async move { namenode.serve_replica(inbound_rx, outbound_tx).await }
    });
    common::wait_for(|| {
        let namenode = namenode.clone();
        async move { namenode.status().await.nodes == 1 }
    })
    .await;

    let result = namenode.create_object("o", b"data").await;
    assert!(matches!(
        result,
        Err(DosError::ReplicationFailed {
            required: 1,
            acked: 0
        })
    ));
    assert!(!namenode.exists("o").await);
    // The candidate goes back into the registry.
    assert_eq!(namenode.status().await.nodes, 1);
    assert!(outbound_rx.recv().await.is_some());
    drop(inbound_tx);
}

/// Register a node that never acks. Keep both channel ends alive for as long
/// as the node should stay registered.
async fn attach_mute(
    namenode: &Arc<NameNode>,
    reported_size: u64,
) -> (mpsc::Sender<NodeFrame>, mpsc::Receiver<Outbound>) {
    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let (outbound_tx, outbound_rx) = mpsc::channel(8);
    inbound_tx
        .send(NodeFrame::beat("mute", "ws://mute", reported_size, Vec::new()))
        .await
        .unwrap();

    let before = namenode.status().await.nodes;
    tokio::spawn({
        let namenode = namenode.clone();
        async move { namenode.serve_replica(inbound_rx, outbound_tx).await }
    });
    common::wait_for(|| {
        let namenode = namenode.clone();
        async move { namenode.status().await.nodes > before }
    })
    .await;
    (inbound_tx, outbound_rx)
}

#[tokio::test]
async fn test_cancelled_create_returns_drawn_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = Arc::new(
        NameNode::new(NameNodeOptions {
            replication: 1,
            create_ack_timeout: None,
            ..Default::default()
        })
        .unwrap(),
    );
    let (mute_tx, _mute_rx) = attach_mute(&namenode, 0).await;

    let create = namenode.create_object("o", b"data");
    assert!(tokio::time::timeout(Duration::from_millis(100), create)
        .await
        .is_err());

    assert_eq!(namenode.status().await.nodes, 1);
    assert!(!namenode.exists("o").await);
    assert_eq!(namenode.sequence(), 0);

    // Once the silent node is gone a real one takes the object.
    drop(mute_tx);
    common::wait_for(|| {
        let namenode = namenode.clone();
        async move { namenode.status().await.nodes == 0 }
    })
    .await;
    let node = attach_node(&namenode, "n1", dir.path()).await;
    let outcome = namenode.create_object("o", b"data").await.unwrap();
    assert_eq!(outcome.holders, vec!["n1"]);
    assert!(node.store.get("o").unwrap().is_some());
}

#[tokio::test]
async fn test_cancelled_update_still_reaches_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(1);
    let n2 = attach_node(&namenode, "n2", dir.path()).await;
    namenode.create_object("o", b"v1").await.unwrap();

    // The largest reported size puts the silent node first in every fan-out.
    let (mute_tx, _mute_rx) = attach_mute(&namenode, 1 << 40).await;

    let update = namenode.update_object("o", b"v2");
    assert!(tokio::time::timeout(Duration::from_millis(100), update)
        .await
        .is_err());
    assert_eq!(namenode.sequence(), 2);

    drop(mute_tx);
    let store = n2.store.clone();
    common::wait_for(move || {
        let store = store.clone();
        async move {
            store.get("o").unwrap().map(|object| object.data) == Some(b"v2".to_vec())
        }
    })
    .await;

    let report = namenode.update_object("o", b"v3").await.unwrap();
    assert_eq!(report.sequence, 3);
    assert_eq!(report.acked, vec!["n2"]);
    assert_eq!(n2.store.get("o").unwrap().unwrap().data, b"v3".to_vec());
}

#[tokio::test]
async fn test_reported_copy_does_not_add_holder_to_held_object() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = namenode(1);
    let _n2 = attach_node(&namenode, "n2", dir.path()).await;
    namenode.create_object("x", b"fresh").await.unwrap();
    assert_eq!(namenode.holders_of("x").await.unwrap(), vec!["n2"]);

    // Left over from an earlier life of n1.
    SqliteStore::open(dir.path().join("n1.db"))
        .unwrap()
        .write("x", b"stale")
        .unwrap();
    let _n1 = attach_node(&namenode, "n1", dir.path()).await;

    assert_eq!(namenode.holders_of("x").await.unwrap(), vec!["n2"]);
    assert_eq!(namenode.lease_object("x").await.unwrap(), vec![lease_endpoint("n2")]);
}

#[tokio::test]
async fn test_tolerance_requires_registered_ghosts() {
    let dir = tempfile::tempdir().unwrap();
    let namenode = Arc::new(
        NameNode::new(NameNodeOptions {
            replication: 1,
            tolerance: 1,
            ..Default::default()
        })
        .unwrap(),
    );
    let _node = attach_node(&namenode, "n1", dir.path()).await;

    let result = namenode.create_object("o", b"data").await;
    assert!(matches!(
        result,
        Err(DosError::ToleranceNotMet {
            required: 1,
            available: 0
        })
    ));

    let _ghost = common::attach_ghost(&namenode, "g1").await;
    namenode.create_object("o", b"data").await.unwrap();
}

#[tokio::test]
async fn test_namespace_file_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let namespace_file = dir.path().join("namespace.txt");
    let options = NameNodeOptions {
        replication: 1,
        namespace_file: Some(namespace_file.clone()),
        ..Default::default()
    };

    let namenode = Arc::new(NameNode::new(options.clone()).unwrap());
    let node = attach_node(&namenode, "n1", dir.path()).await;
    namenode.create_object("kept", b"1").await.unwrap();
    namenode.create_object("dropped", b"2").await.unwrap();
    namenode.delete_object("dropped").await.unwrap();

    let restarted = Arc::new(NameNode::new(options).unwrap());
    assert!(restarted.exists("kept").await);
    assert!(!restarted.exists("dropped").await);
    assert!(restarted.holders_of("kept").await.unwrap().is_empty());

    // Holders come back from the objects a node reports when it registers.
    let _ = node.disconnect().await;
    let _node = attach_node(&restarted, "n1", dir.path()).await;
    assert_eq!(restarted.holders_of("kept").await.unwrap(), vec!["n1"]);
}
