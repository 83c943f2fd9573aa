// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent connection layer tests against scripted agents.
//!
//! These tests cover request/answer correlation, the difference between a
//! timed out and an unavailable host, disconnect handling and host listeners.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cirrus_core::CoreError;
use cirrus_core::agent::{
    AnswerListener, ConnectionFailure, HostEventMask, HostListener, HostLiveness, PingMonitor,
    PingMonitorConfig, PingReport,
};
use cirrus_core::fsm::HostStatus;
use cirrus_core::persistence::HostRecord;
use cirrus_protocol::messages::{AgentAnswer, AgentRequest, Answer, Command, StartupInfo};
use common::*;

async fn connected_node(cluster: &TestCluster, hosts: &[i64]) -> TestNode {
    let node = cluster.node("node-a").await;
    for host_id in hosts {
        let host = cluster.add_host(*host_id, None).await;
        node.manager.connect_host(&host).await.unwrap();
    }
    node
}

fn cmd(name: &str) -> Vec<Command> {
    vec![Command::new(name, Vec::new())]
}

#[tokio::test]
async fn test_concurrent_sends_get_their_own_answers() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;

    // Later requests are answered first.
    cluster.connector.set_delay(1, |req: &AgentRequest| {
        Duration::from_millis(120u64.saturating_sub(req.sequence * 10))
    });

    let sends = (0..10).map(|i| {
        let manager = node.manager.clone();
        async move {
            let name = format!("cmd-{}", i);
            let answer = manager
                .send(1, cmd(&name), Duration::from_secs(5))
                .await
                .unwrap();
            (name, answer)
        }
    });
    let results = futures::future::join_all(sends).await;

    let mut sequences = HashSet::new();
    for (name, answer) in &results {
        assert_eq!(answer.host_id, 1);
        assert_eq!(answer.answers.len(), 1);
        assert_eq!(&answer.answers[0].command, name);
        sequences.insert(answer.sequence);
    }
    assert_eq!(sequences.len(), 10);
    assert!(node.manager.pending_sequences(1).is_empty());
}

#[tokio::test]
async fn test_timeout_is_distinct_from_unavailable() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1, 2]).await;

    cluster.connector.set_behavior(1, MockBehavior::Silent);
    let err = node
        .manager
        .send(1, cmd("start_vm"), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::OperationTimedOut {
            host_id: 1,
            timeout_ms: 100
        }
    );
    assert!(err.is_outcome_unknown());
    // A timeout says nothing about the connection.
    assert!(node.manager.has_ready_direct(1));
    assert!(node.manager.pending_sequences(1).is_empty());

    cluster.connector.set_behavior(2, MockBehavior::FailWrites);
    let err = node
        .manager
        .send(2, cmd("start_vm"), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AgentUnavailable { host_id: 2, .. }));
    assert!(!err.is_outcome_unknown());

    let manager = node.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || !manager.has_direct(2)).await);
    assert!(wait_for_host_status(&node, 2, HostStatus::Alert).await);
}

#[tokio::test]
async fn test_late_answer_does_not_complete_newer_request() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;
    cluster.connector.set_behavior(1, MockBehavior::Silent);

    node.manager
        .send(1, cmd("first"), Duration::from_millis(50))
        .await
        .unwrap_err();
    let stale_sequence = cluster.connector.sent_requests(1)[0].sequence;

    let manager = node.manager.clone();
    let pending = tokio::spawn(async move {
        manager
            .send(1, cmd("second"), Duration::from_secs(5))
            .await
    });
    let manager = node.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || manager.pending_sequences(1).len() == 1).await);
    let live_sequence = node.manager.pending_sequences(1)[0];
    assert_ne!(live_sequence, stale_sequence);

    cluster.connector.inject_answer(
        1,
        AgentAnswer {
            host_id: 1,
            sequence: stale_sequence,
            answers: vec![Answer::success("first", Vec::new())],
        },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    cluster.connector.inject_answer(
        1,
        AgentAnswer {
            host_id: 1,
            sequence: live_sequence,
            answers: vec![Answer::success("second", Vec::new())],
        },
    );
    let answer = pending.await.unwrap().unwrap();
    assert_eq!(answer.sequence, live_sequence);
    assert_eq!(answer.answers[0].command, "second");
}

#[tokio::test]
async fn test_lost_connection_fails_outstanding_requests() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;
    cluster.connector.set_behavior(1, MockBehavior::Silent);
    cluster.connector.set_liveness(1, HostLiveness::Down);

    let manager = node.manager.clone();
    let pending = tokio::spawn(async move {
        manager
            .send(1, cmd("stop_vm"), Duration::from_secs(30))
            .await
    });
    let manager = node.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || !manager.pending_sequences(1).is_empty()).await);

    cluster.connector.kill_connection(1, "connection reset");

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::AgentUnavailable { host_id: 1, .. }));
    assert!(wait_for_host_status(&node, 1, HostStatus::Down).await);
    assert!(!node.manager.has_direct(1));
}

#[tokio::test]
async fn test_investigation_keeps_live_connection() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;

    let torn_down = node
        .manager
        .handle_disconnect(1, cirrus_core::fsm::HostEvent::PingTimeout, true, false)
        .await
        .unwrap();
    assert!(!torn_down);
    assert!(node.manager.has_ready_direct(1));
    assert_eq!(node.manager.host_status(1).await.unwrap().state, HostStatus::Up);

    // Forcing skips the investigation.
    let torn_down = node
        .manager
        .handle_disconnect(1, cirrus_core::fsm::HostEvent::AgentDisconnected, true, true)
        .await
        .unwrap();
    assert!(torn_down);
    assert!(!node.manager.has_direct(1));
    assert_eq!(node.manager.host_status(1).await.unwrap().state, HostStatus::Alert);
}

#[tokio::test]
async fn test_owned_host_reconnects_but_agent_shutdown_does_not() {
    let cluster = TestCluster::new().await;
    cluster.add_host(1, None).await;
    cluster.add_host(2, None).await;
    let node = cluster.node("node-a").await;

    let report = scan(&node).await;
    assert_eq!(report.connected, vec![1, 2]);

    cluster.connector.kill_connection(1, "network blip");
    let connector = cluster.connector.clone();
    assert!(wait_until(Duration::from_secs(2), || connector.connect_count(1) == 2).await);
    assert!(wait_for_host_status(&node, 1, HostStatus::Up).await);

    cluster.connector.send_shutdown(2, "agent upgrade");
    assert!(wait_for_host_status(&node, 2, HostStatus::Disconnected).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cluster.connector.connect_count(2), 1);
    assert!(!node.manager.has_direct(2));
}

#[derive(Default)]
struct Recorder {
    name: String,
    calls: Arc<Mutex<Vec<String>>>,
    refuse: Option<ConnectionFailure>,
}

#[async_trait]
impl HostListener for Recorder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_connect(
        &self,
        host: &HostRecord,
        _startup: &StartupInfo,
    ) -> Result<(), ConnectionFailure> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:connect:{}", self.name, host.host_id));
        match &self.refuse {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    async fn on_disconnect(&self, host_id: i64, _status: Option<HostStatus>) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:disconnect:{}", self.name, host_id));
    }

    fn before_send(&self, host_id: i64, sequence: u64, commands: &[Command]) {
        self.calls.lock().unwrap().push(format!(
            "{}:send:{}:{}:{}",
            self.name, host_id, sequence, commands[0].name
        ));
    }
}

#[tokio::test]
async fn test_fatal_connect_refusal_unwinds_earlier_listeners() {
    let cluster = TestCluster::new().await;
    let node = cluster.node("node-a").await;
    let host = cluster.add_host(1, None).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    node.manager.register_for_host_events(
        Arc::new(Recorder {
            name: "storage".into(),
            calls: calls.clone(),
            refuse: None,
        }),
        HostEventMask::CONNECTIONS,
    );
    node.manager.register_for_host_events(
        Arc::new(Recorder {
            name: "network".into(),
            calls: calls.clone(),
            refuse: Some(ConnectionFailure::fatal("bridge missing")),
        }),
        HostEventMask::CONNECTIONS,
    );

    let err = node.manager.connect_host(&host).await.unwrap_err();
    assert!(matches!(err, CoreError::AgentUnavailable { host_id: 1, .. }));
    assert!(!node.manager.has_direct(1));
    assert_eq!(
        node.manager.host_status(1).await.unwrap().state,
        HostStatus::Disconnected
    );
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "storage:connect:1".to_string(),
            "network:connect:1".to_string(),
            "storage:disconnect:1".to_string(),
        ]
    );
}

struct RefuseOnce {
    attempts: AtomicUsize,
}

#[async_trait]
impl HostListener for RefuseOnce {
    fn name(&self) -> &str {
        "refuse-once"
    }

    async fn on_connect(
        &self,
        _host: &HostRecord,
        _startup: &StartupInfo,
    ) -> Result<(), ConnectionFailure> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ConnectionFailure::retriable("host still booting"))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_retriable_connect_refusal_reconnects() {
    let cluster = TestCluster::new().await;
    cluster.add_host(1, None).await;
    let node = cluster.node("node-a").await;
    let listener = Arc::new(RefuseOnce {
        attempts: AtomicUsize::new(0),
    });
    node.manager
        .register_for_host_events(listener.clone(), HostEventMask::CONNECTIONS);

    let report = scan(&node).await;
    assert_eq!(report.claimed, vec![1]);
    assert!(report.connected.is_empty());

    let manager = node.manager.clone();
    assert!(wait_until(Duration::from_secs(2), || manager.has_ready_direct(1)).await);
    assert_eq!(listener.attempts.load(Ordering::SeqCst), 2);
    assert!(wait_for_host_status(&node, 1, HostStatus::Up).await);
}

#[tokio::test]
async fn test_before_send_sees_each_batch_until_unregistered() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;
    let calls = Arc::new(Mutex::new(Vec::new()));

    let id = node.manager.register_for_host_events(
        Arc::new(Recorder {
            name: "audit".into(),
            calls: calls.clone(),
            refuse: None,
        }),
        HostEventMask::ALL,
    );

    let answer = node
        .manager
        .send(1, cmd("reboot_vm"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        *calls.lock().unwrap(),
        vec![format!("audit:send:1:{}:reboot_vm", answer.sequence)]
    );

    assert!(node.manager.unregister_host_listener(id));
    assert!(!node.manager.unregister_host_listener(id));
    node.manager
        .send(1, cmd("reboot_vm"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_send_async_completes_exactly_once() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1, 2]).await;
    cluster.connector.set_behavior(2, MockBehavior::Silent);

    let results: Arc<Mutex<Vec<(i64, u64, Result<AgentAnswer, CoreError>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let listener: Arc<dyn AnswerListener> =
        Arc::new(move |host_id: i64, sequence: u64, result: Result<AgentAnswer, CoreError>| {
            sink.lock().unwrap().push((host_id, sequence, result));
        });

    let answered = node
        .manager
        .send_async(1, cmd("ping"), Duration::from_secs(1), listener.clone())
        .await
        .unwrap();
    let timed_out = node
        .manager
        .send_async(2, cmd("ping"), Duration::from_millis(50), listener)
        .await
        .unwrap();

    let seen = results.clone();
    assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 2);
    for (host_id, sequence, result) in results.iter() {
        match host_id {
            1 => {
                assert_eq!(*sequence, answered);
                assert_eq!(result.as_ref().unwrap().sequence, answered);
            }
            2 => {
                assert_eq!(*sequence, timed_out);
                assert!(matches!(result, Err(CoreError::OperationTimedOut { host_id: 2, .. })));
            }
            other => panic!("unexpected host {}", other),
        }
    }
}

#[tokio::test]
async fn test_longest_timeouts_are_accepted() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;

    let answer = node
        .manager
        .send(1, cmd("ping"), Duration::MAX)
        .await
        .unwrap();
    assert_eq!(answer.answers[0].command, "ping");

    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    let listener: Arc<dyn AnswerListener> =
        Arc::new(move |_: i64, _: u64, result: Result<AgentAnswer, CoreError>| {
            assert!(result.is_ok());
            counter.fetch_add(1, Ordering::SeqCst);
        });
    node.manager
        .send_async(1, cmd("ping"), Duration::MAX, listener)
        .await
        .unwrap();
    let seen = done.clone();
    assert!(wait_until(Duration::from_secs(2), || seen.load(Ordering::SeqCst) == 1).await);
    assert!(node.manager.pending_sequences(1).is_empty());
}

#[tokio::test]
async fn test_send_to_unknown_or_unowned_host() {
    let cluster = TestCluster::new().await;
    let node = cluster.node("node-a").await;

    let err = node
        .manager
        .send(99, cmd("ping"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err, CoreError::HostNotFound { host_id: 99 });

    cluster.add_host(1, None).await;
    let err = node
        .manager
        .send(1, cmd("ping"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::AgentUnavailable { host_id: 1, .. }));
}

#[tokio::test]
async fn test_ping_records_liveness() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1]).await;
    assert!(cluster.host(1).await.last_ping_at.is_none());

    node.manager.ping(1, Duration::from_secs(1)).await.unwrap();

    assert!(cluster.host(1).await.last_ping_at.is_some());
    let sent = cluster.connector.sent_requests(1);
    assert_eq!(sent.last().unwrap().commands[0].name, Command::ping().name);
}

#[tokio::test]
async fn test_ping_sweep_takes_dead_hosts_down() {
    let cluster = TestCluster::new().await;
    let node = connected_node(&cluster, &[1, 2, 3]).await;
    cluster.connector.set_behavior(2, MockBehavior::Silent);
    cluster.connector.set_liveness(2, HostLiveness::Down);

    let monitor = PingMonitor::new(
        node.manager.clone(),
        PingMonitorConfig {
            ping_interval: Duration::from_secs(3600),
            ping_timeout: Duration::from_millis(100),
            max_concurrent_pings: 1,
        },
    );

    let report = monitor.ping_all().await;
    assert_eq!(
        report,
        PingReport {
            healthy: vec![1, 3],
            failed: vec![2],
        }
    );
    assert!(!node.manager.has_direct(2));
    assert_eq!(node.manager.host_status(2).await.unwrap().state, HostStatus::Down);

    // Disconnected hosts are no longer pinged.
    let report = monitor.ping_all().await;
    assert_eq!(report.healthy, vec![1, 3]);
    assert!(report.failed.is_empty());

    let monitor = Arc::new(monitor);
    let running = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });
    monitor.shutdown_handle().notify_one();
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("monitor should stop")
        .unwrap();
}
