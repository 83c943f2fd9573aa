// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cirrus Core - management node
//!
//! Runs one management node: connects to the shared store, claims its share
//! of hosts, keeps agent connections alive and serves peer requests.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use cirrus_core::agent::{
    AgentManagerConfig, PingMonitorConfig, QuicAgentConnector, QuicAgentConnectorConfig,
};
use cirrus_core::cluster::{NodeIdentity, OwnershipScannerConfig, QuicPeerChannel, QuicPeerConfig};
use cirrus_core::config::Config;
use cirrus_core::jobs::JobDispatcherConfig;
use cirrus_core::migrations::{self, Backend};
use cirrus_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use cirrus_core::runtime::NodeRuntime;
use cirrus_protocol::server::CirrusServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cirrus_core=info".parse()?),
        )
        .init();

    info!("Starting Cirrus Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        node_id = %config.node_id,
        peer_addr = %config.peer_addr,
        advertise_addr = %config.advertise_addr,
        scan_interval_secs = config.scan_interval.as_secs(),
        node_timeout_secs = config.node_timeout.as_secs(),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = connect_store(&config.database_url).await?;
    info!("Database connection established");

    let connector = Arc::new(QuicAgentConnector::new(QuicAgentConnectorConfig {
        skip_cert_verification: config.skip_cert_verification,
        ..Default::default()
    }));
    let peers = Arc::new(QuicPeerChannel::new(
        persistence.clone(),
        QuicPeerConfig {
            skip_cert_verification: config.skip_cert_verification,
            ..Default::default()
        },
    ));
    let peer_server = Arc::new(CirrusServer::localhost(config.peer_addr)?);

    let runtime = NodeRuntime::builder()
        .persistence(persistence)
        .identity(NodeIdentity::new(
            &config.node_id,
            config.advertise_addr.to_string(),
        ))
        .connector(connector)
        .peers(peers)
        .peer_server(peer_server)
        .agent_config(AgentManagerConfig {
            node_timeout: config.node_timeout,
            investigation: config.investigation.clone(),
            ..Default::default()
        })
        .scanner_config(OwnershipScannerConfig {
            scan_interval: config.scan_interval,
            batch_size: config.scan_batch_size,
            node_timeout: config.node_timeout,
        })
        .ping_config(PingMonitorConfig {
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            max_concurrent_pings: config.max_concurrent_pings,
        })
        .job_config(JobDispatcherConfig {
            max_workers: config.job_workers,
            node_timeout: config.node_timeout,
            ..Default::default()
        })
        .build()?
        .start()
        .await?;

    info!("Cirrus Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

/// Open the store named by `url` and bring its schema up to date.
async fn connect_store(url: &str) -> Result<Arc<dyn Persistence>> {
    let persistence: Arc<dyn Persistence> = match Backend::from_url(url) {
        Some(Backend::Sqlite(path)) if path == ":memory:" => {
            info!("Using in-memory SQLite store");
            Arc::new(SqlitePersistence::in_memory().await?)
        }
        Some(Backend::Sqlite(path)) => {
            info!(path = %path, "Using SQLite store");
            Arc::new(SqlitePersistence::from_path(&path).await?)
        }
        Some(Backend::Postgres) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await?;

            let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
            info!(result = row.0, "Database health check passed");

            info!("Running database migrations...");
            migrations::run_postgres(&pool).await?;
            info!("Migrations completed");
            Arc::new(PostgresPersistence::new(pool))
        }
        None => anyhow::bail!("unsupported database URL scheme: {}", url),
    };
    Ok(persistence)
}
