// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State machine behaviour against a shared store, as seen by several nodes.

use std::sync::Arc;

use cirrus_core::CoreError;
use cirrus_core::fsm::kinds::{host_machine, vm_machine};
use cirrus_core::fsm::{HostEvent, HostStatus, VmEvent, VmState};
use cirrus_core::persistence::{Persistence, SqlitePersistence};

/// Drive a fresh VM to `Stopped` at version 3.
async fn stopped_at_version_3(store: &dyn Persistence, id: &str) {
    let vm = vm_machine().build().unwrap();
    let v0 = vm.create(store, id, None).await.unwrap();
    let v1 = vm.transition(store, &v0, VmEvent::Start).await.unwrap();
    let v2 = vm.transition(store, &v1, VmEvent::StartFailed).await.unwrap();
    let v3 = vm
        .transition(store, &v2, VmEvent::AgentReportStopped)
        .await
        .unwrap();
    assert_eq!((v3.state, v3.update_version), (VmState::Stopped, 3));
}

#[tokio::test]
async fn test_start_from_version_3_and_stale_second_attempt() {
    let store = SqlitePersistence::in_memory().await.unwrap();
    stopped_at_version_3(&store, "vm-42").await;

    // Two nodes read the same snapshot.
    let node_a = vm_machine().build().unwrap();
    let node_b = vm_machine().build().unwrap();
    let seen_by_a = node_a.load(&store, "vm-42").await.unwrap();
    let seen_by_b = node_b.load(&store, "vm-42").await.unwrap();
    assert_eq!(seen_by_a, seen_by_b);

    let starting = node_a
        .transition(&store, &seen_by_a, VmEvent::Start)
        .await
        .unwrap();
    assert_eq!(starting.state, VmState::Starting);
    assert_eq!(starting.update_version, 4);

    let err = node_b
        .transition(&store, &seen_by_b, VmEvent::Start)
        .await
        .unwrap_err();
    match err {
        CoreError::StaleResource { state, version, .. } => {
            assert_eq!(state, "Stopped");
            assert_eq!(version, 3);
        }
        other => panic!("expected StaleResource, got {:?}", other),
    }

    let stored = store.get_resource("vm", "vm-42").await.unwrap().unwrap();
    assert_eq!(stored.state, "Starting");
    assert_eq!(stored.update_version, 4);

    // The loser re-reads and sees the winner's result.
    let fresh = node_b.load(&store, "vm-42").await.unwrap();
    assert_eq!(fresh, starting);
}

#[tokio::test]
async fn test_concurrent_transitions_have_exactly_one_winner() {
    let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let vm = Arc::new(vm_machine().build().unwrap());
    let snapshot = vm.create(store.as_ref(), "vm-race", None).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let vm = vm.clone();
        let snapshot = snapshot.clone();
        tasks.push(tokio::spawn(async move {
            vm.transition(store.as_ref(), &snapshot, VmEvent::Start).await
        }));
    }

    let mut winners = 0;
    let mut stale = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(v) => {
                assert_eq!(v.update_version, 1);
                winners += 1;
            }
            Err(CoreError::StaleResource { .. }) => stale += 1,
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(stale, 7);
}

#[tokio::test]
async fn test_same_inputs_same_outputs_on_every_node() {
    let a = host_machine().build().unwrap();
    let b = host_machine().build().unwrap();
    for state in [
        HostStatus::Creating,
        HostStatus::Connecting,
        HostStatus::Up,
        HostStatus::Alert,
        HostStatus::Disconnected,
        HostStatus::Down,
    ] {
        for event in [
            HostEvent::AgentConnected,
            HostEvent::Ready,
            HostEvent::Ping,
            HostEvent::PingTimeout,
            HostEvent::AgentDisconnected,
            HostEvent::HostDown,
            HostEvent::ShutdownRequested,
            HostEvent::ManagementServerDown,
        ] {
            assert_eq!(a.next_state(state, event), b.next_state(state, event));
        }
    }
    assert_eq!(
        a.next_state(HostStatus::Up, HostEvent::AgentDisconnected),
        Some(HostStatus::Alert)
    );
    assert_eq!(a.next_state(HostStatus::Removed, HostEvent::Ping), None);
}

#[tokio::test]
async fn test_illegal_event_reports_state_and_event() {
    let store = SqlitePersistence::in_memory().await.unwrap();
    let vm = vm_machine().build().unwrap();
    let stopped = vm.create(&store, "vm-1", None).await.unwrap();

    let err = vm
        .transition(&store, &stopped, VmEvent::Migrated)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        CoreError::IllegalTransition {
            kind: "vm".to_string(),
            resource_id: "vm-1".to_string(),
            state: "Stopped".to_string(),
            event: "Migrated".to_string(),
        }
    );
    assert_eq!(vm.load(&store, "vm-1").await.unwrap().update_version, 0);
}
