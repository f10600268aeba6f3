#![allow(non_snake_case)]
mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    doc, fast_builder, mongos, primary, secondary, standalone, streaming_standalone, wait_for,
    FakeCluster, FakeSrvRecords, Scripted,
};
use mongodb_sdam::{
    CommandOptions, ConnectionState, Namespace, ReadPreference, SdamError, SdamEvent,
    SelectServerOptions, ServerAddress, ServerDescription, ServerSelector, ServerType,
    TopologyDescription, TopologyType,
};
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_test::assert_ok;

const RS_HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

fn replica_set(cluster: &FakeCluster) {
    cluster.set_node("a:27017", primary("rs0", &RS_HOSTS));
    cluster.set_node("b:27017", secondary("rs0", &RS_HOSTS));
    cluster.set_node("c:27017", secondary("rs0", &RS_HOSTS));
}

fn people() -> Namespace {
    Namespace::new("app", "people")
}

#[tokio::test]
async fn single_seed_connects_as_single() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", standalone());
    let topology = fast_builder(&cluster).set_hosts(&["a:27017"]).build().unwrap();

    // Act
    assert_ok!(topology.connect().await);
    let server = topology
        .select_server(ServerSelector::Writable, Default::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(topology.description().topology_type, TopologyType::Single);
    assert_eq!(server.address(), &ServerAddress::new("a", 27017));
    assert_eq!(server.description().server_type, ServerType::Standalone);
    assert_eq!(server.state(), ConnectionState::Connected);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn replica_set_seed_discovers_the_other_members() {
    // Arrange
    let cluster = FakeCluster::new();
    replica_set(&cluster);
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_replica_set("rs0")
        .build()
        .unwrap();

    // Act
    assert_ok!(topology.connect().await);
    let description = wait_for(&topology, |d| {
        d.servers.len() == 3 && d.servers.values().all(|s| s.is_known())
    })
    .await;
    let server = topology
        .select_server(ReadPreference::secondary().into(), Default::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server.description().server_type, ServerType::RSSecondary);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn two_mongos_seeds_become_sharded() {
    let cluster = FakeCluster::new();
    cluster.set_node("s1:27017", mongos());
    cluster.set_node("s2:27017", mongos());
    let topology = fast_builder(&cluster)
        .set_hosts(&["s1:27017", "s2:27017"])
        .build()
        .unwrap();

    assert_ok!(topology.connect().await);
    let description = wait_for(&topology, |d| d.topology_type == TopologyType::Sharded).await;

    assert_eq!(description.servers.len(), 2);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn selection_timeout_is_honoured() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("b:27017", secondary("rs0", &["b:27017"]));
    let topology = fast_builder(&cluster)
        .set_hosts(&["b:27017"])
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    let options = SelectServerOptions {
        server_selection_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };

    // Act
    let started = Instant::now();
    let result = topology
        .select_server(ServerSelector::Writable, options)
        .await;
    let elapsed = started.elapsed();

    // Assert
    match result {
        Err(SdamError::ServerSelection { description, .. }) => {
            assert_eq!(description.topology_type, TopologyType::ReplicaSetNoPrimary)
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(50), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(150), "took {:?}", elapsed);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn connect_closes_the_topology_when_nothing_answers() {
    // Arrange
    let cluster = FakeCluster::new();
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017", "b:27017"])
        .set_server_selection_timeout(Duration::from_millis(100))
        .build()
        .unwrap();

    // Act
    let connected = topology.connect().await;
    let selected = topology
        .select_server(ServerSelector::Writable, Default::default())
        .await;

    // Assert
    assert!(matches!(connected, Err(SdamError::ServerSelection { .. })));
    assert!(matches!(selected, Err(SdamError::TopologyClosed)));
}

#[tokio::test]
async fn retryable_write_is_retried_once_with_the_same_transaction_number() {
    // Arrange
    let cluster = FakeCluster::new();
    replica_set(&cluster);
    let topology = fast_builder(&cluster)
        .set_hosts(&RS_HOSTS)
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    wait_for(&topology, |d| d.has_primary()).await;
    cluster.script("a:27017", Scripted::NetworkError);

    // Act
    let reply = topology
        .insert(&people(), vec![doc(json!({"name": "ada"}))], CommandOptions::default(), None)
        .await;

    // Assert
    assert!(reply.is_ok(), "{:?}", reply);
    let inserts = cluster.commands("a:27017");
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].get("txnNumber"), Some(&json!(1)));
    assert_eq!(inserts[0].get("txnNumber"), inserts[1].get("txnNumber"));
    assert_eq!(inserts[0].get("lsid"), inserts[1].get("lsid"));
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn second_failure_is_returned() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", primary("rs0", &["a:27017"]));
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    let exceeded = json!({"ok": 0, "code": 262, "codeName": "ExceededTimeLimit", "errmsg": "slow"});
    cluster.script("a:27017", Scripted::Reply(exceeded.clone()));
    cluster.script("a:27017", Scripted::Reply(exceeded));

    // Act
    let result = topology
        .insert(&people(), vec![doc(json!({"n": 1}))], CommandOptions::default(), None)
        .await;

    // Assert
    assert_eq!(result.unwrap_err().code(), Some(262));
    assert_eq!(cluster.commands("a:27017").len(), 2);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn non_retryable_errors_are_not_retried() {
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", primary("rs0", &["a:27017"]));
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    cluster.script(
        "a:27017",
        Scripted::Reply(json!({"ok": 0, "code": 11000, "errmsg": "duplicate key"})),
    );

    let result = topology
        .insert(&people(), vec![doc(json!({"_id": 1}))], CommandOptions::default(), None)
        .await;

    assert_eq!(result.unwrap_err().code(), Some(11000));
    assert_eq!(cluster.commands("a:27017").len(), 1);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn retries_can_be_switched_off() {
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", primary("rs0", &["a:27017"]));
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_replica_set("rs0")
        .set_retry_writes(false)
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    cluster.script("a:27017", Scripted::NetworkError);

    let result = topology
        .insert(&people(), vec![doc(json!({"n": 1}))], CommandOptions::default(), None)
        .await;

    assert!(result.unwrap_err().is_network_error());
    let inserts = cluster.commands("a:27017");
    assert_eq!(inserts.len(), 1);
    assert!(inserts[0].get("txnNumber").is_none());
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn unchanged_heartbeats_publish_no_change_events() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", standalone());
    let topology = fast_builder(&cluster).set_hosts(&["a:27017"]).build().unwrap();
    assert_ok!(topology.connect().await);
    let mut events = topology.subscribe();

    // Act
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Assert
    let mut heartbeats = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SdamEvent::ServerHeartbeatSucceeded(_) => heartbeats += 1,
            SdamEvent::ServerDescriptionChanged(_) | SdamEvent::TopologyDescriptionChanged(_) => {
                panic!("unexpected change event {:?}", event)
            }
            _ => {}
        }
    }
    assert!(heartbeats >= 2, "only {} heartbeats", heartbeats);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", standalone());
    let topology = fast_builder(&cluster).set_hosts(&["a:27017"]).build().unwrap();
    let mut events = topology.subscribe();

    // Act
    assert_ok!(topology.connect().await);
    assert_ok!(topology.close().await);
    assert_ok!(topology.close().await);

    // Assert
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SdamEvent::TopologyOpening(_) => seen.push("topologyOpening"),
            SdamEvent::ServerOpening(_) => seen.push("serverOpening"),
            SdamEvent::ServerDescriptionChanged(_) => seen.push("serverDescriptionChanged"),
            SdamEvent::TopologyDescriptionChanged(_) => seen.push("topologyDescriptionChanged"),
            SdamEvent::ServerClosed(_) => seen.push("serverClosed"),
            SdamEvent::TopologyClosed(_) => seen.push("topologyClosed"),
            _ => {}
        }
    }
    assert_eq!(
        seen,
        vec![
            "topologyOpening",
            "serverOpening",
            "serverDescriptionChanged",
            "topologyDescriptionChanged",
            "serverClosed",
            "topologyClosed"
        ]
    );
}

#[tokio::test]
async fn close_ends_pooled_sessions() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", primary("rs0", &["a:27017"]));
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    let mut session = topology.start_session();
    let lsid = session.lsid();
    topology
        .insert(&people(), vec![doc(json!({"n": 1}))], CommandOptions::default(), Some(&mut session))
        .await
        .unwrap();
    drop(session);

    // Act
    assert_ok!(topology.close().await);

    // Assert
    let commands = cluster.commands("a:27017");
    assert_eq!(commands[0].get("lsid"), Some(&lsid));
    let end_sessions = commands.last().unwrap();
    assert_eq!(end_sessions.get("endSessions"), Some(&json!([lsid])));
}

#[tokio::test]
async fn load_balanced_mode_skips_monitoring() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("lb:27017", standalone());
    let topology = fast_builder(&cluster)
        .set_hosts(&["lb:27017"])
        .set_load_balanced(true)
        .build()
        .unwrap();

    // Act
    assert_ok!(topology.connect().await);
    let server = topology
        .select_server(ServerSelector::Writable, Default::default())
        .await
        .unwrap();
    topology
        .command(&Namespace::database("admin"), doc(json!({"ping": 1})), CommandOptions::default(), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert_eq!(topology.description().topology_type, TopologyType::LoadBalanced);
    assert_eq!(server.description().server_type, ServerType::LoadBalancer);
    assert_eq!(cluster.heartbeat_count("lb:27017"), 0);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn cursor_follows_the_server_that_answered_find() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", standalone());
    cluster.script(
        "a:27017",
        Scripted::Reply(json!({"ok": 1, "cursor": {"id": 7, "firstBatch": [{"n": 1}]}})),
    );
    cluster.script(
        "a:27017",
        Scripted::Reply(json!({"ok": 1, "cursor": {"id": 0, "nextBatch": [{"n": 2}]}})),
    );
    let topology = fast_builder(&cluster).set_hosts(&["a:27017"]).build().unwrap();
    assert_ok!(topology.connect().await);

    // Act
    let mut cursor = topology
        .cursor(people(), doc(json!({})), Some(1), CommandOptions::default())
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(document) = cursor.next().await.unwrap() {
        seen.push(document);
    }

    // Assert
    assert_eq!(seen, vec![doc(json!({"n": 1})), doc(json!({"n": 2}))]);
    assert!(cursor.is_exhausted());
    let commands = cluster.commands("a:27017");
    assert_eq!(commands[1].get("getMore"), Some(&json!(7)));
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn stepped_down_primary_is_rediscovered() {
    // Arrange
    let cluster = FakeCluster::new();
    replica_set(&cluster);
    let topology = fast_builder(&cluster)
        .set_hosts(&RS_HOSTS)
        .set_replica_set("rs0")
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    wait_for(&topology, |d| d.has_primary()).await;

    // Act
    cluster.set_node("a:27017", secondary("rs0", &RS_HOSTS));
    cluster.set_node("b:27017", primary("rs0", &RS_HOSTS));
    let description = wait_for(&topology, |d| {
        d.server(&ServerAddress::new("b", 27017))
            .map_or(false, |s| s.server_type == ServerType::RSPrimary)
            && d.server(&ServerAddress::new("a", 27017))
                .map_or(false, |s| s.server_type == ServerType::RSSecondary)
    })
    .await;
    let server = topology
        .select_server(ServerSelector::Writable, Default::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(description.topology_type, TopologyType::ReplicaSetWithPrimary);
    assert_eq!(server.address(), &ServerAddress::new("b", 27017));
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn pending_selection_keeps_requesting_checks() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", standalone());
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_heartbeat_frequency(Duration::from_secs(10))
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    let before = cluster.heartbeat_count("a:27017");
    let nothing = ServerSelector::Custom(Arc::new(
        |_: &TopologyDescription, _: &[ServerDescription]| Vec::new(),
    ));
    let options = SelectServerOptions {
        server_selection_timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    // Act
    let result = topology.select_server(nothing, options).await;

    // Assert
    assert!(matches!(result, Err(SdamError::ServerSelection { .. })));
    let after = cluster.heartbeat_count("a:27017");
    assert!(after > before + 2, "heartbeats went from {} to {}", before, after);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn retried_write_follows_the_new_primary() {
    // Arrange
    let cluster = FakeCluster::new();
    replica_set(&cluster);
    let topology = fast_builder(&cluster)
        .set_hosts(&RS_HOSTS)
        .set_replica_set("rs0")
        .set_heartbeat_frequency(Duration::from_secs(10))
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    wait_for(&topology, |d| d.has_primary()).await;
    cluster.set_node("a:27017", secondary("rs0", &RS_HOSTS));
    cluster.set_node("b:27017", primary("rs0", &RS_HOSTS));
    cluster.script("a:27017", Scripted::NetworkError);

    // Act
    let reply = topology
        .insert(&people(), vec![doc(json!({"name": "ada"}))], CommandOptions::default(), None)
        .await;

    // Assert
    assert!(reply.is_ok(), "{:?}", reply);
    let failed = cluster.commands("a:27017");
    let retried = cluster.commands("b:27017");
    assert_eq!(failed.len(), 1);
    assert_eq!(retried.len(), 1);
    assert_eq!(failed[0].get("txnNumber"), retried[0].get("txnNumber"));
    assert_eq!(failed[0].get("lsid"), retried[0].get("lsid"));
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn network_error_restarts_a_streaming_monitor() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("a:27017", streaming_standalone());
    let topology = fast_builder(&cluster)
        .set_hosts(&["a:27017"])
        .set_heartbeat_frequency(Duration::from_secs(10))
        .set_server_monitoring_streaming(true)
        .build()
        .unwrap();
    assert_ok!(topology.connect().await);
    wait_for(&topology, |d| {
        d.server(&ServerAddress::new("a", 27017))
            .map_or(false, |s| s.topology_version.is_some())
    })
    .await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while cluster.command_count("a:27017", "hello") == 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cluster.command_count("a:27017", "hello"), 1);
    assert_eq!(cluster.command_count("a:27017", "isMaster"), 1);
    cluster.script("a:27017", Scripted::NetworkError);

    // Act
    let _ = topology
        .insert(&people(), vec![doc(json!({"name": "ada"}))], CommandOptions::default(), None)
        .await;

    // Assert
    let deadline = Instant::now() + Duration::from_secs(2);
    while cluster.command_count("a:27017", "isMaster") < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cluster.command_count("a:27017", "isMaster"), 2);
    assert_ok!(topology.close().await);
}

#[tokio::test]
async fn srv_polling_adds_mongos_published_later() {
    // Arrange
    let cluster = FakeCluster::new();
    cluster.set_node("s1.example.com:27017", mongos());
    cluster.set_node("s2.example.com:27017", mongos());
    cluster.set_node("s3.example.com:27017", mongos());
    let records = FakeSrvRecords::new(&["s1.example.com:27017", "s2.example.com:27017"]);
    let topology = fast_builder(&cluster)
        .set_srv_host("cluster0.example.com")
        .set_srv_resolver(records.clone())
        .set_heartbeat_frequency(Duration::from_secs(10))
        .set_rescan_srv_interval(Duration::from_millis(50))
        .resolve_srv_seedlist()
        .await
        .unwrap()
        .build()
        .unwrap();
    let mut events = topology.subscribe();
    assert_ok!(topology.connect().await);
    wait_for(&topology, |d| d.topology_type == TopologyType::Sharded).await;

    // Act
    records.set(&[
        "s1.example.com:27017",
        "s2.example.com:27017",
        "s3.example.com:27017",
    ]);
    let description = wait_for(&topology, |d| {
        d.server(&ServerAddress::new("s3.example.com", 27017))
            .map_or(false, |s| s.server_type == ServerType::Mongos)
    })
    .await;

    // Assert
    assert_eq!(description.servers.len(), 3);
    let mut discovered = false;
    loop {
        match events.try_recv() {
            Ok(SdamEvent::SrvRecordDiscovery(event)) => {
                discovered = discovered || event.addresses.len() == 3
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert!(discovered);
    assert_ok!(topology.close().await);
}
