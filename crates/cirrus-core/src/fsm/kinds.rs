// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transition tables for the built-in resource kinds.
//!
//! Each function returns a builder so callers can attach listeners before
//! building.

use super::{ResourceKind, StateMachine, StateMachineBuilder};

token_enum! {
    /// Virtual machine lifecycle.
    pub enum VmState {
        Stopped => "Stopped",
        Starting => "Starting",
        Running => "Running",
        Stopping => "Stopping",
        Migrating => "Migrating",
        Destroyed => "Destroyed",
        Expunging => "Expunging",
        Expunged => "Expunged",
        Error => "Error",
    }
}

token_enum! {
    pub enum VmEvent {
        Start => "Start",
        Started => "Started",
        StartFailed => "StartFailed",
        Stop => "Stop",
        Stopped => "Stopped",
        StopFailed => "StopFailed",
        Migrate => "Migrate",
        Migrated => "Migrated",
        MigrationFailed => "MigrationFailed",
        Destroy => "Destroy",
        Recover => "Recover",
        Expunge => "Expunge",
        Expunged => "Expunged",
        ExpungeFailed => "ExpungeFailed",
        AgentReportRunning => "AgentReportRunning",
        AgentReportStopped => "AgentReportStopped",
    }
}

token_enum! {
    /// Connection status of a managed host.
    pub enum HostStatus {
        Creating => "Creating",
        Connecting => "Connecting",
        Up => "Up",
        Alert => "Alert",
        Disconnected => "Disconnected",
        Down => "Down",
        Removed => "Removed",
    }
}

token_enum! {
    pub enum HostEvent {
        AgentConnected => "AgentConnected",
        Ready => "Ready",
        Ping => "Ping",
        PingTimeout => "PingTimeout",
        AgentDisconnected => "AgentDisconnected",
        HostDown => "HostDown",
        ShutdownRequested => "ShutdownRequested",
        ManagementServerDown => "ManagementServerDown",
        Remove => "Remove",
    }
}

token_enum! {
    pub enum NetworkState {
        Allocated => "Allocated",
        Implementing => "Implementing",
        Implemented => "Implemented",
        Shutdown => "Shutdown",
        Destroyed => "Destroyed",
    }
}

token_enum! {
    pub enum NetworkEvent {
        Implement => "Implement",
        OperationSucceeded => "OperationSucceeded",
        OperationFailed => "OperationFailed",
        ShutdownRequested => "ShutdownRequested",
        Destroy => "Destroy",
    }
}

token_enum! {
    /// Lifecycle of a volume or other object placed on a data store.
    pub enum VolumeState {
        Allocated => "Allocated",
        Creating => "Creating",
        Ready => "Ready",
        Copying => "Copying",
        Migrating => "Migrating",
        Destroying => "Destroying",
        Destroyed => "Destroyed",
        Failed => "Failed",
    }
}

token_enum! {
    pub enum VolumeEvent {
        CreateRequested => "CreateRequested",
        CopyRequested => "CopyRequested",
        MigrationRequested => "MigrationRequested",
        DestroyRequested => "DestroyRequested",
        OperationSucceeded => "OperationSucceeded",
        OperationFailed => "OperationFailed",
    }
}

pub fn vm_machine() -> StateMachineBuilder<VmState, VmEvent> {
    use VmEvent as E;
    use VmState as S;

    StateMachine::builder(ResourceKind::Vm, S::Stopped)
        .edge(S::Stopped, E::Start, S::Starting)
        .edge(S::Stopped, E::Destroy, S::Destroyed)
        .edge(S::Stopped, E::AgentReportRunning, S::Running)
        .edge(S::Stopped, E::AgentReportStopped, S::Stopped)
        .edge(S::Starting, E::Started, S::Running)
        .edge(S::Starting, E::StartFailed, S::Stopped)
        .edge(S::Starting, E::AgentReportRunning, S::Running)
        .edge(S::Starting, E::AgentReportStopped, S::Stopped)
        .edge(S::Running, E::Stop, S::Stopping)
        .edge(S::Running, E::Migrate, S::Migrating)
        .edge(S::Running, E::AgentReportRunning, S::Running)
        .edge(S::Running, E::AgentReportStopped, S::Stopped)
        .edge(S::Stopping, E::Stopped, S::Stopped)
        .edge(S::Stopping, E::StopFailed, S::Running)
        .edge(S::Stopping, E::AgentReportRunning, S::Running)
        .edge(S::Stopping, E::AgentReportStopped, S::Stopped)
        .edge(S::Migrating, E::Migrated, S::Running)
        .edge(S::Migrating, E::MigrationFailed, S::Running)
        .edge(S::Migrating, E::AgentReportStopped, S::Stopped)
        .edge(S::Destroyed, E::Recover, S::Stopped)
        .edge(S::Destroyed, E::Expunge, S::Expunging)
        .edge(S::Expunging, E::Expunged, S::Expunged)
        .edge(S::Expunging, E::ExpungeFailed, S::Error)
        .edge(S::Error, E::Destroy, S::Destroyed)
        .edge(S::Error, E::Expunge, S::Expunging)
}

pub fn host_machine() -> StateMachineBuilder<HostStatus, HostEvent> {
    use HostEvent as E;
    use HostStatus as S;

    StateMachine::builder(ResourceKind::Host, S::Creating)
        .edge(S::Creating, E::AgentConnected, S::Connecting)
        .edge(S::Creating, E::AgentDisconnected, S::Disconnected)
        .edge(S::Creating, E::Remove, S::Removed)
        .edge(S::Connecting, E::AgentConnected, S::Connecting)
        .edge(S::Connecting, E::Ready, S::Up)
        .edge(S::Connecting, E::Ping, S::Up)
        .edge(S::Connecting, E::PingTimeout, S::Alert)
        .edge(S::Connecting, E::AgentDisconnected, S::Disconnected)
        .edge(S::Connecting, E::HostDown, S::Down)
        .edge(S::Connecting, E::ShutdownRequested, S::Disconnected)
        .edge(S::Connecting, E::ManagementServerDown, S::Disconnected)
        .edge(S::Up, E::AgentConnected, S::Connecting)
        .edge(S::Up, E::Ping, S::Up)
        .edge(S::Up, E::PingTimeout, S::Alert)
        .edge(S::Up, E::AgentDisconnected, S::Alert)
        .edge(S::Up, E::HostDown, S::Down)
        .edge(S::Up, E::ShutdownRequested, S::Disconnected)
        .edge(S::Up, E::ManagementServerDown, S::Disconnected)
        .edge(S::Alert, E::AgentConnected, S::Connecting)
        .edge(S::Alert, E::Ping, S::Up)
        .edge(S::Alert, E::PingTimeout, S::Alert)
        .edge(S::Alert, E::AgentDisconnected, S::Disconnected)
        .edge(S::Alert, E::HostDown, S::Down)
        .edge(S::Alert, E::ShutdownRequested, S::Disconnected)
        .edge(S::Alert, E::ManagementServerDown, S::Disconnected)
        .edge(S::Disconnected, E::AgentConnected, S::Connecting)
        .edge(S::Disconnected, E::Ping, S::Up)
        .edge(S::Disconnected, E::PingTimeout, S::Alert)
        .edge(S::Disconnected, E::AgentDisconnected, S::Disconnected)
        .edge(S::Disconnected, E::HostDown, S::Down)
        .edge(S::Disconnected, E::ShutdownRequested, S::Disconnected)
        .edge(S::Disconnected, E::ManagementServerDown, S::Disconnected)
        .edge(S::Disconnected, E::Remove, S::Removed)
        .edge(S::Down, E::AgentConnected, S::Connecting)
        .edge(S::Down, E::Ping, S::Up)
        .edge(S::Down, E::PingTimeout, S::Down)
        .edge(S::Down, E::AgentDisconnected, S::Down)
        .edge(S::Down, E::HostDown, S::Down)
        .edge(S::Down, E::ManagementServerDown, S::Down)
        .edge(S::Down, E::Remove, S::Removed)
}

pub fn network_machine() -> StateMachineBuilder<NetworkState, NetworkEvent> {
    use NetworkEvent as E;
    use NetworkState as S;

    StateMachine::builder(ResourceKind::Network, S::Allocated)
        .edge(S::Allocated, E::Implement, S::Implementing)
        .edge(S::Allocated, E::Destroy, S::Destroyed)
        .edge(S::Implementing, E::OperationSucceeded, S::Implemented)
        .edge(S::Implementing, E::OperationFailed, S::Shutdown)
        .edge(S::Implemented, E::Implement, S::Implementing)
        .edge(S::Implemented, E::ShutdownRequested, S::Shutdown)
        .edge(S::Shutdown, E::OperationSucceeded, S::Allocated)
        .edge(S::Shutdown, E::OperationFailed, S::Implemented)
        .edge(S::Shutdown, E::Destroy, S::Destroyed)
}

pub fn volume_machine() -> StateMachineBuilder<VolumeState, VolumeEvent> {
    use VolumeEvent as E;
    use VolumeState as S;

    StateMachine::builder(ResourceKind::Volume, S::Allocated)
        .edge(S::Allocated, E::CreateRequested, S::Creating)
        .edge(S::Allocated, E::DestroyRequested, S::Destroying)
        .edge(S::Creating, E::OperationSucceeded, S::Ready)
        .edge(S::Creating, E::OperationFailed, S::Failed)
        .edge(S::Ready, E::CopyRequested, S::Copying)
        .edge(S::Ready, E::MigrationRequested, S::Migrating)
        .edge(S::Ready, E::DestroyRequested, S::Destroying)
        .edge(S::Copying, E::OperationSucceeded, S::Ready)
        .edge(S::Copying, E::OperationFailed, S::Ready)
        .edge(S::Migrating, E::OperationSucceeded, S::Ready)
        .edge(S::Migrating, E::OperationFailed, S::Ready)
        .edge(S::Destroying, E::OperationSucceeded, S::Destroyed)
        .edge(S::Destroying, E::OperationFailed, S::Failed)
        .edge(S::Failed, E::DestroyRequested, S::Destroying)
}
