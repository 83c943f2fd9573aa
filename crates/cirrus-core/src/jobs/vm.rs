// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual machine lifecycle handlers.
//!
//! Each operation moves the VM into its transitional state, sends the agent
//! command to the host and then takes the success or failure edge. A command
//! that times out leaves the VM in the transitional state: whether the host
//! acted on it is unknown until the agent reports the VM's actual state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_protocol::messages::{AgentAnswer, Command};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::handler::{JobContext, RecoveryPolicy, WorkHandler};
use super::params::{JobParams, ParamKey};
use crate::error::CoreError;
use crate::fsm::{StateMachine, Versioned, VmEvent, VmState};

/// Answer code an agent uses when the host cannot fit the VM.
pub const INSUFFICIENT_CAPACITY_CODE: &str = "insufficient_capacity";

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Where a VM runs, recorded as the VM resource payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPlacement {
    pub host_id: i64,
}

#[derive(Serialize)]
struct VmCommand<'a> {
    vm_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_host_id: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmOperation {
    Start,
    Stop,
    Reboot,
    Migrate,
    Expunge,
}

impl VmOperation {
    pub const ALL: [VmOperation; 5] = [
        Self::Start,
        Self::Stop,
        Self::Reboot,
        Self::Migrate,
        Self::Expunge,
    ];

    pub fn handler_name(&self) -> &'static str {
        match self {
            Self::Start => "start_vm",
            Self::Stop => "stop_vm",
            Self::Reboot => "reboot_vm",
            Self::Migrate => "migrate_vm",
            Self::Expunge => "expunge_vm",
        }
    }

    /// Agent command name; matches the handler name.
    fn command(&self) -> &'static str {
        self.handler_name()
    }

    /// Event entering the transitional state, and that state.
    fn begin(&self) -> Option<(VmEvent, VmState)> {
        match self {
            Self::Start => Some((VmEvent::Start, VmState::Starting)),
            Self::Stop => Some((VmEvent::Stop, VmState::Stopping)),
            Self::Reboot => None,
            Self::Migrate => Some((VmEvent::Migrate, VmState::Migrating)),
            Self::Expunge => Some((VmEvent::Expunge, VmState::Expunging)),
        }
    }

    fn succeeded(&self) -> Option<VmEvent> {
        match self {
            Self::Start => Some(VmEvent::Started),
            Self::Stop => Some(VmEvent::Stopped),
            Self::Reboot => None,
            Self::Migrate => Some(VmEvent::Migrated),
            Self::Expunge => Some(VmEvent::Expunged),
        }
    }

    fn failed(&self) -> Option<VmEvent> {
        match self {
            Self::Start => Some(VmEvent::StartFailed),
            Self::Stop => Some(VmEvent::StopFailed),
            Self::Reboot => None,
            Self::Migrate => Some(VmEvent::MigrationFailed),
            Self::Expunge => Some(VmEvent::ExpungeFailed),
        }
    }
}

/// Runs one [`VmOperation`] as a work job.
pub struct VmLifecycleHandler {
    op: VmOperation,
    fsm: Arc<StateMachine<VmState, VmEvent>>,
}

impl VmLifecycleHandler {
    pub fn new(op: VmOperation, fsm: Arc<StateMachine<VmState, VmEvent>>) -> Self {
        Self { op, fsm }
    }

    /// Apply `event`, re-reading once if an agent report moved the VM meanwhile.
    async fn settle(
        &self,
        ctx: &JobContext,
        vm: &Versioned<VmState>,
        event: VmEvent,
        payload: Option<&str>,
    ) -> Result<Versioned<VmState>, CoreError> {
        let store = ctx.persistence().as_ref();
        let attempt = match payload {
            Some(p) => self.fsm.transition_with_payload(store, vm, event, p).await,
            None => self.fsm.transition(store, vm, event).await,
        };
        match attempt {
            Err(CoreError::StaleResource { .. }) => {
                let fresh = self.fsm.load(store, &vm.id).await?;
                warn!(vm_id = %vm.id, state = %fresh.state, event = %event, "VM changed during operation, retrying");
                match payload {
                    Some(p) => self.fsm.transition_with_payload(store, &fresh, event, p).await,
                    None => self.fsm.transition(store, &fresh, event).await,
                }
            }
            other => other,
        }
    }

    async fn fail(&self, ctx: &JobContext, vm: &Versioned<VmState>, error: CoreError) -> CoreError {
        if let Some(event) = self.op.failed()
            && let Err(e) = self.settle(ctx, vm, event, None).await
        {
            warn!(vm_id = %vm.id, event = %event, error = %e, "Failed to record VM failure");
        }
        error
    }

    async fn send(
        &self,
        ctx: &JobContext,
        host_id: i64,
        command: &str,
        body: &VmCommand<'_>,
        timeout: Duration,
    ) -> Result<AgentAnswer, CoreError> {
        let payload = serde_json::to_vec(body)?;
        ctx.send(host_id, vec![Command::new(command, payload)], timeout)
            .await
    }
}

fn answer_error(answer: &AgentAnswer, host_id: i64, command: &str) -> CoreError {
    match answer.first_failure() {
        Some(failure) if failure.code == INSUFFICIENT_CAPACITY_CODE => CoreError::InsufficientCapacity {
            reason: format!("host {}: {}", host_id, failure.details),
        },
        Some(failure) => CoreError::ResourceUnavailable {
            resource: format!("host/{}", host_id),
            reason: format!("{} failed: {}", failure.command, failure.details),
        },
        None => CoreError::ResourceUnavailable {
            resource: format!("host/{}", host_id),
            reason: format!("{} failed without details", command),
        },
    }
}

#[async_trait]
impl WorkHandler for VmLifecycleHandler {
    fn name(&self) -> &'static str {
        self.op.handler_name()
    }

    fn required_params(&self) -> &'static [ParamKey] {
        match self.op {
            VmOperation::Migrate => &[ParamKey::HostId, ParamKey::TargetHostId],
            _ => &[ParamKey::HostId],
        }
    }

    fn optional_params(&self) -> &'static [ParamKey] {
        match self.op {
            VmOperation::Stop => &[ParamKey::TimeoutSecs, ParamKey::Force, ParamKey::Reason],
            _ => &[ParamKey::TimeoutSecs, ParamKey::Reason],
        }
    }

    fn recovery_policy(&self) -> RecoveryPolicy {
        match self.op {
            // Expunging an already expunged VM is a no-op on the host.
            VmOperation::Expunge => RecoveryPolicy::Rerun,
            _ => RecoveryPolicy::MarkFailed,
        }
    }

    async fn execute(
        &self,
        ctx: &JobContext,
        params: &JobParams,
    ) -> Result<serde_json::Value, CoreError> {
        let host_id = params.require_int(ParamKey::HostId)?;
        let timeout = params
            .int(ParamKey::TimeoutSecs)?
            .map(|s| Duration::from_secs(s.max(1) as u64))
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
        let target = params.int(ParamKey::TargetHostId)?;
        if target == Some(host_id) {
            return Err(CoreError::Validation {
                field: ParamKey::TargetHostId.as_str().to_string(),
                message: "target host equals source host".to_string(),
            });
        }
        let store = ctx.persistence().as_ref();
        let vm_id = ctx.resource_id();

        let mut vm = self.fsm.load(store, vm_id).await?;
        match self.op.begin() {
            Some((_, transitional)) if vm.state == transitional && ctx.attempt() > 1 => {
                info!(vm_id, state = %vm.state, attempt = ctx.attempt(), "Resuming VM operation");
            }
            Some((event, _)) => vm = self.fsm.transition(store, &vm, event).await?,
            None if vm.state != VmState::Running => {
                return Err(CoreError::ResourceUnavailable {
                    resource: format!("vm/{}", vm_id),
                    reason: format!("{} requires a running VM, it is {}", self.op.handler_name(), vm.state),
                });
            }
            None => {}
        }

        if let Some(target) = target {
            let prepare = VmCommand {
                vm_id,
                target_host_id: None,
                force: false,
            };
            match self
                .send(ctx, target, "prepare_migration", &prepare, timeout)
                .await
            {
                Ok(answer) if answer.is_success() => {}
                Ok(answer) => {
                    let error = answer_error(&answer, target, "prepare_migration");
                    return Err(self.fail(ctx, &vm, error).await);
                }
                Err(e) => return Err(self.fail(ctx, &vm, e).await),
            }
            if let Err(e) = ctx.check_cancelled().await {
                return Err(self.fail(ctx, &vm, e).await);
            }
        }

        let body = VmCommand {
            vm_id,
            target_host_id: target,
            force: params.bool(ParamKey::Force)?.unwrap_or(false),
        };
        match self.send(ctx, host_id, self.op.command(), &body, timeout).await {
            Ok(answer) if answer.is_success() => {
                let placement = match self.op {
                    VmOperation::Start => Some(VmPlacement { host_id }),
                    VmOperation::Migrate => target.map(|host_id| VmPlacement { host_id }),
                    _ => None,
                };
                let payload = placement.map(|p| serde_json::to_string(&p)).transpose()?;
                let state = match self.op.succeeded() {
                    Some(event) => {
                        self.settle(ctx, &vm, event, payload.as_deref())
                            .await?
                            .state
                    }
                    None => vm.state,
                };
                info!(vm_id, operation = self.op.handler_name(), state = %state, "VM operation succeeded");
                Ok(json!({
                    "vm_id": vm_id,
                    "state": state.as_str(),
                    "host_id": placement.map(|p| p.host_id).unwrap_or(host_id),
                }))
            }
            Ok(answer) => {
                let error = answer_error(&answer, host_id, self.op.command());
                Err(self.fail(ctx, &vm, error).await)
            }
            Err(e) if e.is_outcome_unknown() => {
                warn!(vm_id, state = %vm.state, error = %e, "VM operation outcome unknown");
                Err(e)
            }
            Err(e) => Err(self.fail(ctx, &vm, e).await),
        }
    }
}

/// One handler per [`VmOperation`], sharing the VM state machine.
pub fn vm_handlers(fsm: Arc<StateMachine<VmState, VmEvent>>) -> Vec<Arc<dyn WorkHandler>> {
    VmOperation::ALL
        .iter()
        .map(|op| Arc::new(VmLifecycleHandler::new(*op, fsm.clone())) as Arc<dyn WorkHandler>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_protocol::messages::Answer;

    #[test]
    fn test_capacity_failure_maps_to_insufficient_capacity() {
        let answer = AgentAnswer {
            host_id: 3,
            sequence: 1,
            answers: vec![Answer::failure("start_vm", INSUFFICIENT_CAPACITY_CODE, "no free memory")],
        };
        let err = answer_error(&answer, 3, "start_vm");
        assert!(matches!(err, CoreError::InsufficientCapacity { .. }));
        assert_eq!(err.error_code(), "INSUFFICIENT_CAPACITY");
    }

    #[test]
    fn test_other_failure_maps_to_resource_unavailable() {
        let answer = AgentAnswer {
            host_id: 3,
            sequence: 1,
            answers: vec![Answer::failure("stop_vm", "libvirt", "domain not found")],
        };
        match answer_error(&answer, 3, "stop_vm") {
            CoreError::ResourceUnavailable { resource, reason } => {
                assert_eq!(resource, "host/3");
                assert!(reason.contains("domain not found"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_command_body_omits_defaults() {
        let body = VmCommand {
            vm_id: "vm-1",
            target_host_id: None,
            force: false,
        };
        assert_eq!(serde_json::to_string(&body).unwrap(), r#"{"vm_id":"vm-1"}"#);
    }

    #[test]
    fn test_handler_names_are_unique() {
        let names: std::collections::HashSet<_> =
            VmOperation::ALL.iter().map(|op| op.handler_name()).collect();
        assert_eq!(names.len(), VmOperation::ALL.len());
    }
}
