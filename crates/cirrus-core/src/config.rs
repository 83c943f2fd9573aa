// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::investigator::{InvestigationPolicy, InvestigationStep};

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Cluster-unique id of this management node
    pub node_id: String,
    /// Bind address of the peer QUIC endpoint
    pub peer_addr: SocketAddr,
    /// Address peers use to reach this node
    pub advertise_addr: SocketAddr,
    /// Interval between agent pings
    pub ping_interval: Duration,
    /// How long a ping may wait for its answer
    pub ping_timeout: Duration,
    /// Cap on concurrently outstanding pings
    pub max_concurrent_pings: usize,
    /// Interval between ownership scans
    pub scan_interval: Duration,
    /// Hosts claimed per scan
    pub scan_batch_size: u32,
    /// Heartbeat age after which a node is considered dead
    pub node_timeout: Duration,
    /// Concurrent work job executions
    pub job_workers: usize,
    /// Check order used before declaring a host down
    pub investigation: InvestigationPolicy,
    /// Skip TLS verification on agent and peer links (development only)
    pub skip_cert_verification: bool,
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    hint: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, hint))
}

fn parse_secs(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(key, default, "must be a whole number of seconds")?;
    if secs == 0 {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CIRRUS_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `CIRRUS_NODE_ID`: node id (default: random UUID)
    /// - `CIRRUS_PEER_PORT`: peer QUIC port (default: 8250)
    /// - `CIRRUS_PEER_ADVERTISE_ADDR`: address announced to peers (default: 127.0.0.1:<peer port>)
    /// - `CIRRUS_PING_INTERVAL_SECS` (default: 60)
    /// - `CIRRUS_PING_TIMEOUT_SECS` (default: 30)
    /// - `CIRRUS_MAX_CONCURRENT_PINGS` (default: 50)
    /// - `CIRRUS_SCAN_INTERVAL_SECS` (default: 10)
    /// - `CIRRUS_SCAN_BATCH_SIZE` (default: 16)
    /// - `CIRRUS_NODE_TIMEOUT_SECS` (default: 60)
    /// - `CIRRUS_JOB_WORKERS` (default: 16)
    /// - `CIRRUS_INVESTIGATION_ORDER`: comma separated steps (default: direct,neighbors,peers)
    /// - `CIRRUS_SKIP_CERT_VERIFICATION`: `true`/`1` to disable TLS verification
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CIRRUS_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CIRRUS_DATABASE_URL"))?;

        let node_id = std::env::var("CIRRUS_NODE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let peer_port: u16 = parse_var("CIRRUS_PEER_PORT", "8250", "must be a valid port number")?;
        let peer_addr = SocketAddr::from(([0, 0, 0, 0], peer_port));

        let advertise_addr = match std::env::var("CIRRUS_PEER_ADVERTISE_ADDR") {
            Ok(v) => v.parse().map_err(|_| {
                ConfigError::Invalid("CIRRUS_PEER_ADVERTISE_ADDR", "must be host:port")
            })?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], peer_port)),
        };

        let ping_interval = parse_secs("CIRRUS_PING_INTERVAL_SECS", "60")?;
        let ping_timeout = parse_secs("CIRRUS_PING_TIMEOUT_SECS", "30")?;
        let max_concurrent_pings: usize = parse_var(
            "CIRRUS_MAX_CONCURRENT_PINGS",
            "50",
            "must be a positive integer",
        )?;
        let scan_interval = parse_secs("CIRRUS_SCAN_INTERVAL_SECS", "10")?;
        let scan_batch_size: u32 =
            parse_var("CIRRUS_SCAN_BATCH_SIZE", "16", "must be a positive integer")?;
        let node_timeout = parse_secs("CIRRUS_NODE_TIMEOUT_SECS", "60")?;
        let job_workers: usize =
            parse_var("CIRRUS_JOB_WORKERS", "16", "must be a positive integer")?;

        if max_concurrent_pings == 0 {
            return Err(ConfigError::Invalid(
                "CIRRUS_MAX_CONCURRENT_PINGS",
                "must be greater than zero",
            ));
        }
        if job_workers == 0 {
            return Err(ConfigError::Invalid(
                "CIRRUS_JOB_WORKERS",
                "must be greater than zero",
            ));
        }

        let investigation = match std::env::var("CIRRUS_INVESTIGATION_ORDER") {
            Ok(v) => parse_investigation_order(&v)?,
            Err(_) => InvestigationPolicy::default(),
        };

        let skip_cert_verification = std::env::var("CIRRUS_SKIP_CERT_VERIFICATION")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            node_id,
            peer_addr,
            advertise_addr,
            ping_interval,
            ping_timeout,
            max_concurrent_pings,
            scan_interval,
            scan_batch_size,
            node_timeout,
            job_workers,
            investigation,
            skip_cert_verification,
        })
    }
}

fn parse_investigation_order(value: &str) -> Result<InvestigationPolicy, ConfigError> {
    let mut steps = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let step = match part.to_ascii_lowercase().as_str() {
            "direct" => InvestigationStep::Direct,
            "neighbors" => InvestigationStep::Neighbors,
            "peers" => InvestigationStep::Peers,
            _ => {
                return Err(ConfigError::Invalid(
                    "CIRRUS_INVESTIGATION_ORDER",
                    "steps must be direct, neighbors or peers",
                ));
            }
        };
        if !steps.contains(&step) {
            steps.push(step);
        }
    }
    Ok(InvestigationPolicy::new(steps))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
