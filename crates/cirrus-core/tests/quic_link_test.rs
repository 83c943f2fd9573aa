// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent and peer traffic over real QUIC connections on loopback.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cirrus_core::agent::{
    AgentConnector, AgentManager, HostLiveness, QuicAgentConnector, QuicAgentConnectorConfig,
};
use cirrus_core::cluster::{
    NodeIdentity, OwnershipScanner, OwnershipScannerConfig, PeerRequestHandler, QuicPeerChannel,
    QuicPeerConfig, run_peer_server,
};
use cirrus_core::fsm::HostStatus;
use cirrus_core::persistence::{HostRecord, NewHost, Persistence, SqlitePersistence};
use cirrus_protocol::messages::{
    AgentAnswer, AgentMessage, Answer, Command, NodeMessage, StartupInfo, node_message,
};
use cirrus_protocol::{CirrusServer, ConnectionHandler, MessageType, StreamHandler};

/// Command that makes the fake agent announce its shutdown.
const GOODBYE: &str = "goodbye";

/// Host id the fake agent misreports during the handshake.
const CONFUSED_HOST: i64 = 13;

/// A host agent that answers every command and echoes its payload.
async fn fake_agent(stream: StreamHandler) {
    let (mut tx, mut rx) = stream.into_channel();
    let Ok(hello) = rx.read_message::<NodeMessage>(MessageType::Request).await else {
        return;
    };
    let Some(node_message::Kind::Hello(hello)) = hello.kind else {
        return;
    };
    let reported = if hello.host_id == CONFUSED_HOST {
        hello.host_id + 100
    } else {
        hello.host_id
    };
    let startup = AgentMessage::startup(StartupInfo {
        host_id: reported,
        name: format!("host-{}", hello.host_id),
        version: "2.1.0".into(),
        capabilities: vec!["kvm".into()],
    });
    if tx.send_notice(&startup).await.is_err() {
        return;
    }

    while let Ok(message) = rx.read_message::<NodeMessage>(MessageType::Request).await {
        let Some(node_message::Kind::Request(request)) = message.kind else {
            continue;
        };
        if request.commands.iter().any(|c| c.name == GOODBYE) {
            let _ = tx
                .send_notice(&AgentMessage::shutdown(request.host_id, "agent restarting"))
                .await;
            return;
        }
        let answer = AgentAnswer {
            host_id: request.host_id,
            sequence: request.sequence,
            answers: request
                .commands
                .iter()
                .map(|c| Answer::success(c.name.clone(), c.payload.clone()))
                .collect(),
        };
        if tx.respond(&AgentMessage::answer(answer)).await.is_err() {
            return;
        }
    }
}

fn spawn_agent() -> (Arc<CirrusServer>, SocketAddr) {
    let server = Arc::new(CirrusServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner
            .run(|conn: ConnectionHandler| async move { conn.run(fake_agent).await })
            .await;
    });
    (server, addr)
}

fn quic_connector() -> QuicAgentConnector {
    QuicAgentConnector::new(QuicAgentConnectorConfig {
        skip_cert_verification: true,
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        reach_timeout: Duration::from_millis(300),
        ..Default::default()
    })
}

fn host_at(host_id: i64, address: &str) -> HostRecord {
    HostRecord {
        host_id,
        name: format!("host-{}", host_id),
        address: address.to_string(),
        cluster: None,
        owner_node: None,
        owner_version: 0,
        claimed_at: None,
        last_ping_at: None,
        created_at: chrono::Utc::now(),
    }
}

async fn owned_host(store: &dyn Persistence, host_id: i64, address: String, owner: &str) -> HostRecord {
    store
        .register_host(&NewHost {
            host_id,
            name: format!("host-{}", host_id),
            address,
            cluster: None,
        })
        .await
        .unwrap();
    store
        .upsert_node(owner, "127.0.0.1:1", chrono::Utc::now())
        .await
        .unwrap();
    let claimed = store
        .claim_hosts(owner, chrono::Utc::now() - chrono::Duration::seconds(30), 16)
        .await
        .unwrap();
    claimed
        .into_iter()
        .find(|h| h.host_id == host_id)
        .expect("host should be claimable")
}

#[tokio::test]
async fn test_agent_session_over_quic() {
    let (agent, addr) = spawn_agent();
    let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let host = owned_host(store.as_ref(), 5, addr.to_string(), "node-a").await;

    let manager = AgentManager::builder("node-a", store.clone(), Arc::new(quic_connector()))
        .build()
        .unwrap();
    manager.connect_host(&host).await.unwrap();
    assert!(manager.has_ready_direct(5));
    assert_eq!(manager.host_status(5).await.unwrap().state, HostStatus::Up);

    let sends = (0..5).map(|i| {
        let manager = manager.clone();
        async move {
            let payload = format!("vm-{}", i).into_bytes();
            let answer = manager
                .send(
                    5,
                    vec![Command::new("start_vm", payload.clone())],
                    Duration::from_secs(2),
                )
                .await
                .unwrap();
            assert_eq!(answer.answers[0].payload, payload);
            answer.sequence
        }
    });
    let mut sequences = futures::future::join_all(sends).await;
    sequences.sort_unstable();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    manager.ping(5, Duration::from_secs(2)).await.unwrap();

    // The agent announces its shutdown instead of answering.
    let err = manager
        .send(5, vec![Command::new(GOODBYE, Vec::new())], Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        cirrus_core::CoreError::AgentUnavailable { host_id: 5, .. }
    ));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while manager.has_direct(5) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!manager.has_direct(5));
    assert_eq!(
        manager.host_status(5).await.unwrap().state,
        HostStatus::Disconnected
    );
    agent.close();
}

#[tokio::test]
async fn test_handshake_rejects_wrong_host() {
    let (agent, addr) = spawn_agent();
    let connector = quic_connector();
    let address = addr.to_string();

    let session = connector.connect(&host_at(7, &address), "node-a").await.unwrap();
    assert_eq!(session.startup.host_id, 7);
    assert_eq!(session.startup.capabilities, vec!["kvm".to_string()]);
    session.link.close().await;

    let err = connector
        .connect(&host_at(CONFUSED_HOST, &address), "node-a")
        .await
        .err()
        .expect("handshake should fail");
    assert!(matches!(err, cirrus_core::CoreError::Protocol { .. }));

    let err = connector
        .connect(&host_at(8, "not-an-address"), "node-a")
        .await
        .err()
        .expect("address should be rejected");
    assert!(matches!(err, cirrus_core::CoreError::Validation { ref field, .. } if field == "address"));
    agent.close();
}

#[tokio::test]
async fn test_reachability_reports_up_or_unknown() {
    let (agent, addr) = spawn_agent();
    let connector = quic_connector();

    let up = host_at(1, &addr.to_string());
    assert_eq!(connector.reachability(&up).await, HostLiveness::Up);

    agent.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let gone = host_at(2, "127.0.0.1:9");
    assert_eq!(connector.reachability(&gone).await, HostLiveness::Unknown);

    let bad = host_at(3, "not-an-address");
    assert_eq!(connector.reachability(&bad).await, HostLiveness::Unknown);
}

#[tokio::test]
async fn test_forwarding_through_peer_server() {
    let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let agents = common::MockConnector::new();

    // Node A owns host 1 and serves peers on loopback.
    let peer_server = Arc::new(CirrusServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let peer_addr = peer_server.local_addr().unwrap();
    let a = AgentManager::builder("node-a", store.clone(), Arc::new(agents.clone()))
        .build()
        .unwrap();
    let server_task = tokio::spawn(run_peer_server(
        peer_server.clone(),
        Arc::new(PeerRequestHandler::new(&a)),
    ));
    let scanner = OwnershipScanner::new(
        NodeIdentity::new("node-a", peer_addr.to_string()),
        a.clone(),
        OwnershipScannerConfig::default(),
    );
    store
        .register_host(&NewHost {
            host_id: 1,
            name: "host-1".into(),
            address: "10.0.0.1:8260".into(),
            cluster: None,
        })
        .await
        .unwrap();
    let report = scanner.scan_once().await.unwrap();
    assert_eq!(report.connected, vec![1]);

    // Node B reaches node A through the address in the node registry.
    let peers = Arc::new(QuicPeerChannel::new(
        store.clone(),
        QuicPeerConfig {
            skip_cert_verification: true,
            ..Default::default()
        },
    ));
    let b = AgentManager::builder("node-b", store.clone(), Arc::new(agents.clone()))
        .peers(peers)
        .build()
        .unwrap();

    let answer = b
        .send(1, vec![Command::new("list_vms", Vec::new())], Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(answer.host_id, 1);
    assert_eq!(answer.answers[0].command, "list_vms");
    assert_eq!(agents.connect_count(1), 1);
    assert_eq!(b.forwarding_hosts(), vec![(1, "node-a".to_string())]);

    // Errors raised on the owner cross the wire unchanged.
    agents.set_behavior(1, common::MockBehavior::Silent);
    let err = b
        .send(1, vec![Command::new("list_vms", Vec::new())], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        cirrus_core::CoreError::OperationTimedOut {
            host_id: 1,
            timeout_ms: 200
        }
    );

    peer_server.close();
    let _ = server_task.await;
}
