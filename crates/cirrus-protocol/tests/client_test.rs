// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC client/server tests for the peer and agent protocols.

use std::net::SocketAddr;
use std::sync::Arc;

use cirrus_protocol::messages::{
    AgentAnswer, AgentMessage, Answer, HostNoticeKind, Liveness, NodeMessage, PeerRequest,
    PeerResponse, LivenessQuery, StartupInfo, agent_message, node_message, peer_request,
    peer_response,
};
use cirrus_protocol::{
    CirrusClient, CirrusClientConfig, CirrusServer, ClientError, ConnectionHandler, MessageType,
    ServerError, StreamHandler,
};

fn spawn_server<H, Fut>(handler: H) -> (Arc<CirrusServer>, SocketAddr)
where
    H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let server = Arc::new(CirrusServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = server.local_addr().unwrap();
    let runner = server.clone();
    tokio::spawn(async move {
        runner
            .run(move |conn: ConnectionHandler| {
                let handler = handler.clone();
                async move { conn.run(handler).await }
            })
            .await
            .unwrap();
    });
    (server, addr)
}

async fn peer_handler(mut stream: StreamHandler) {
    let _ = stream
        .handle_request(|req: PeerRequest| async move {
            match req.request {
                Some(peer_request::Request::Liveness(p)) if p.host_id == 404 => {
                    Err(ServerError::handler("NOT_OWNER", "host 404 is not owned here"))
                }
                Some(peer_request::Request::Liveness(_)) => Ok(PeerResponse::liveness(Liveness::Up)),
                Some(peer_request::Request::Notify(_)) => Ok(PeerResponse::ack()),
                _ => Ok(PeerResponse::error("INVALID_REQUEST", "unsupported")),
            }
        })
        .await;
}

#[tokio::test]
async fn test_peer_liveness_round_trip() {
    let (server, addr) = spawn_server(peer_handler);
    let client = CirrusClient::new(CirrusClientConfig::insecure(addr)).unwrap();

    let resp: PeerResponse = client
        .request(&PeerRequest::liveness(LivenessQuery {
            source_node: "node-b".into(),
            host_id: 7,
        }))
        .await
        .unwrap();
    match resp.response {
        Some(peer_response::Response::Liveness(p)) => {
            assert_eq!(Liveness::try_from(p.liveness).unwrap(), Liveness::Up)
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(client.is_connected().await);

    // Second call reuses the connection.
    let resp: PeerResponse = client
        .request(&PeerRequest::notify("node-b", 7, HostNoticeKind::Released))
        .await
        .unwrap();
    assert!(matches!(
        resp.response,
        Some(peer_response::Response::Ack(_))
    ));

    client.close().await;
    server.close();
}

#[tokio::test]
async fn test_handler_error_surfaces_as_error_frame() {
    let (server, addr) = spawn_server(peer_handler);
    let client = CirrusClient::new(CirrusClientConfig::insecure(addr)).unwrap();

    let err = client
        .request::<_, PeerResponse>(&PeerRequest::liveness(LivenessQuery {
            source_node: "node-b".into(),
            host_id: 404,
        }))
        .await
        .unwrap_err();
    match err {
        ClientError::Remote { code, message, .. } => {
            assert_eq!(code, "NOT_OWNER");
            assert!(message.contains("404"));
        }
        other => panic!("expected remote error, got {}", other),
    }
    server.close();
}

#[tokio::test]
async fn test_long_lived_agent_channel() {
    let (server, addr) = spawn_server(|stream: StreamHandler| async move {
        let (mut tx, mut rx) = stream.into_channel();
        let hello: NodeMessage = rx.read_message(MessageType::Request).await.unwrap();
        let host_id = match hello.kind {
            Some(node_message::Kind::Hello(h)) => h.host_id,
            other => panic!("expected hello, got {:?}", other),
        };
        tx.send_notice(&AgentMessage::startup(StartupInfo {
            host_id,
            name: format!("host-{}", host_id),
            version: "1.0".into(),
            capabilities: Vec::new(),
        }))
        .await
        .unwrap();

        while let Ok(msg) = rx.read_message::<NodeMessage>(MessageType::Request).await {
            if let Some(node_message::Kind::Request(req)) = msg.kind {
                tx.respond(&AgentMessage::answer(AgentAnswer {
                    host_id: req.host_id,
                    sequence: req.sequence,
                    answers: vec![Answer::success("ping", Vec::new())],
                }))
                .await
                .unwrap();
            }
        }
    });

    let client = CirrusClient::new(CirrusClientConfig::insecure(addr)).unwrap();
    let (mut tx, mut rx) = client.open_channel().await.unwrap();
    tx.send_request(&NodeMessage::hello("node-a", 3))
        .await
        .unwrap();
    let startup: AgentMessage = rx.read_message(MessageType::Notice).await.unwrap();
    assert!(matches!(
        startup.kind,
        Some(agent_message::Kind::Startup(ref s)) if s.name == "host-3"
    ));

    for sequence in 1..=3u64 {
        tx.send_request(&NodeMessage::request(cirrus_protocol::messages::AgentRequest {
            host_id: 3,
            sequence,
            commands: vec![cirrus_protocol::messages::Command::ping()],
            stop_on_error: true,
        }))
        .await
        .unwrap();
        let msg: AgentMessage = rx.read_message(MessageType::Response).await.unwrap();
        match msg.kind {
            Some(agent_message::Kind::Answer(a)) => assert_eq!(a.sequence, sequence),
            other => panic!("expected answer, got {:?}", other),
        }
    }

    client.close().await;
    server.close();
}
