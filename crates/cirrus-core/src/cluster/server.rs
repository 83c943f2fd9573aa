// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer QUIC server.
//!
//! One request/response exchange per stream, served by a [`PeerRequestHandler`].

use std::sync::Arc;

use anyhow::Result;
use cirrus_protocol::frame::Frame;
use cirrus_protocol::messages::{PeerRequest, PeerResponse};
use cirrus_protocol::server::{CirrusServer, ConnectionHandler, StreamHandler};
use tracing::{debug, error, info, instrument};

use super::handler::PeerRequestHandler;

/// Serve peer requests on `server` until it is closed.
#[instrument(skip_all)]
pub async fn run_peer_server(server: Arc<CirrusServer>, handler: Arc<PeerRequestHandler>) -> Result<()> {
    info!(addr = ?server.local_addr().ok(), "Peer QUIC server starting");

    server
        .run(move |conn: ConnectionHandler| {
            let handler = handler.clone();
            async move {
                handle_connection(conn, handler).await;
            }
        })
        .await?;

    info!("Peer QUIC server stopped");
    Ok(())
}

#[instrument(skip(conn, handler), fields(remote = %conn.remote_address()))]
async fn handle_connection(conn: ConnectionHandler, handler: Arc<PeerRequestHandler>) {
    debug!("Peer connection accepted");

    conn.run(move |stream: StreamHandler| {
        let handler = handler.clone();
        async move {
            if let Err(e) = handle_stream(stream, handler).await {
                error!("Peer stream error: {}", e);
            }
        }
    })
    .await;

    debug!("Peer connection closed");
}

async fn handle_stream(mut stream: StreamHandler, handler: Arc<PeerRequestHandler>) -> Result<()> {
    let request: PeerRequest = stream.read_frame().await?.decode()?;
    let response: PeerResponse = handler.handle(request).await;
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}
