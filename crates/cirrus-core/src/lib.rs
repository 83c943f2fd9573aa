// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Core - IaaS control-plane core
//!
//! This crate holds the parts of the control plane that every management node
//! runs: the resource state machines, the connections to host agents, the
//! cluster-wide ownership of hosts, and the per-resource serialization of
//! lifecycle work. All shared state lives in one SQL store (PostgreSQL in
//! production, SQLite for tests and single-node setups).
//!
//! # Architecture
//!
//! ```text
//!   callers (API layer, schedulers)
//!            │ submit(handler, resource, params) -> Outcome
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │    JobDispatcher     │─────►│    StateMachine<S,E> │── CAS on update_version
//! │  one active job per  │      │  pre/post listeners  │
//! │  (kind, resource_id) │      └──────────────────────┘
//! └──────────┬───────────┘
//!            │ send(host_id, commands, timeout)
//!            ▼
//! ┌──────────────────────┐ peer QUIC ┌──────────────────────┐
//! │ AgentManager (node A)│◄─────────►│ AgentManager (node B)│
//! │ direct + forwarding  │           │                      │
//! │      attaches        │           └──────────┬───────────┘
//! └──────────┬───────────┘                      │
//!            │ agent QUIC                       │
//!            ▼                                  ▼
//!        host agents                        host agents
//! ```
//!
//! # Ownership
//!
//! Every host row carries `owner_node` and `owner_version`. A node only opens
//! a direct agent connection to hosts it owns; other nodes forward through the
//! owner. The [`cluster::OwnershipScanner`] heartbeats the node, marks silent
//! peers down and claims their hosts with a compare-and-set on
//! `owner_version`, so at most one live node ever owns a host.
//!
//! # Host status machine
//!
//! ```text
//!           AgentConnected          Ready / Ping
//!  Creating ──────────────► Connecting ──────────────► Up
//!                               ▲                      │ PingTimeout,
//!                               │ AgentConnected       ▼ AgentDisconnected
//!                               └──────────────────  Alert
//!                                                      │ AgentDisconnected
//!                  HostDown                            ▼
//!         Down ◄────────────────────────────────── Disconnected ──Remove──► Removed
//! ```
//!
//! `ShutdownRequested` and `ManagementServerDown` lead to `Disconnected`
//! without investigation; only an investigation that finds the host dead
//! raises `HostDown`.
//!
//! # Configuration
//!
//! The binary reads `CIRRUS_*` environment variables; see [`config::Config`].
//!
//! # Modules
//!
//! - [`fsm`]: typed state machines with optimistic concurrency
//! - [`agent`]: attaches, agent links, investigation and pings
//! - [`cluster`]: peer protocol and the ownership scanner
//! - [`jobs`]: work jobs, handlers and outcomes
//! - [`persistence`]: store trait with PostgreSQL and SQLite backends
//! - [`runtime`]: embeddable node runtime

pub mod agent;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod fsm;
pub mod jobs;
pub mod migrations;
pub mod persistence;
pub mod runtime;

pub use error::CoreError;
pub use runtime::NodeRuntime;
