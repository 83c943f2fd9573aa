// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound QUIC side of the protocol.
//!
//! A management node dials two kinds of endpoints: host agents, where it keeps
//! one long-lived framed channel, and peer nodes, where every forwarded request
//! is a one-shot exchange on its own stream. [`CirrusClient`] serves both and
//! redials lazily when the previous connection has gone away.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{Frame, FrameError, FramedStream, MessageType, read_frame, write_frame};
use crate::messages::RpcError;
use crate::server::DEFAULT_PEER_PORT;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("no connection established")]
    NotConnected,

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    /// The remote side answered with an error frame.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: String,
        message: String,
        details: String,
    },
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Remote {
            code: err.code,
            message: err.message,
            details: err.details,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CirrusClientConfig {
    /// Host agent or peer node to dial.
    pub server_addr: SocketAddr,
    /// Name checked against the remote certificate.
    pub server_name: String,
    /// Accept any certificate. Development clusters with self-signed agents only.
    pub dangerous_skip_cert_verification: bool,
    /// 0 disables keep-alives.
    pub keep_alive_interval_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for CirrusClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PEER_PORT)),
            server_name: "localhost".to_string(),
            dangerous_skip_cert_verification: false,
            keep_alive_interval_ms: 10_000,
            // Agent channels sit idle between pings.
            idle_timeout_ms: 300_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl CirrusClientConfig {
    /// Defaults for `server_addr` with certificate checks turned off.
    pub fn insecure(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            dangerous_skip_cert_verification: true,
            ..Default::default()
        }
    }

    fn transport(&self) -> Result<TransportConfig, ClientError> {
        let mut transport = TransportConfig::default();
        if self.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(self.keep_alive_interval_ms)));
        }
        let idle = Duration::from_millis(self.idle_timeout_ms)
            .try_into()
            .map_err(|e| ClientError::Tls(format!("invalid idle timeout: {}", e)))?;
        transport.max_idle_timeout(Some(idle));
        Ok(transport)
    }

    fn quic_config(&self) -> Result<ClientConfig, ClientError> {
        let tls = if self.dangerous_skip_cert_verification {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_no_client_auth()
        } else {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let mut config = ClientConfig::new(Arc::new(crypto));
        config.transport_config(Arc::new(self.transport()?));
        Ok(config)
    }
}

/// Dialer for one remote endpoint. Holds at most one live connection.
pub struct CirrusClient {
    endpoint: Endpoint,
    live: Mutex<Option<Connection>>,
    config: CirrusClientConfig,
}

impl CirrusClient {
    /// Bind a local endpoint of the remote address's family. Nothing is
    /// dialed until the first call that needs a connection.
    pub fn new(config: CirrusClientConfig) -> Result<Self, ClientError> {
        let local = match config.server_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(config.quic_config()?);

        Ok(Self {
            endpoint,
            live: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &CirrusClientConfig {
        &self.config
    }

    /// Make sure a connection is up, dialing if there is none or the last one
    /// was closed.
    #[instrument(skip(self), fields(addr = %self.config.server_addr))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<Connection, ClientError> {
        let mut live = self.live.lock().await;
        if let Some(conn) = live.as_ref().filter(|c| c.close_reason().is_none()) {
            return Ok(conn.clone());
        }
        if let Some(stale) = live.take() {
            debug!(reason = ?stale.close_reason(), "previous connection gone, redialing");
        }

        let dialing = self
            .endpoint
            .connect(self.config.server_addr, &self.config.server_name)?;
        let conn = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            dialing,
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;

        info!(addr = %self.config.server_addr, "QUIC connection established");
        *live = Some(conn.clone());
        Ok(conn)
    }

    /// Open a long-lived bidirectional stream split into framed halves.
    ///
    /// Agent links use this: the writer is shared by senders and the reader
    /// belongs to the task that routes answers.
    pub async fn open_channel(
        &self,
    ) -> Result<(FramedStream<SendStream>, FramedStream<RecvStream>), ClientError> {
        let (send, recv) = self.connection().await?.open_bi().await?;
        Ok((FramedStream::new(send), FramedStream::new(recv)))
    }

    /// One request, one reply, on a stream of its own.
    ///
    /// An error frame from the remote side becomes [`ClientError::Remote`].
    #[instrument(skip(self, request), fields(addr = %self.config.server_addr))]
    pub async fn request<Req: prost::Message, Resp: prost::Message + Default>(
        &self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let (mut send, mut recv) = self.connection().await?.open_bi().await?;
        write_frame(&mut send, &Frame::request(request)?).await?;
        send.finish()?;

        let reply = read_frame(&mut recv).await?;
        match reply.message_type {
            MessageType::Response => Ok(reply.decode()?),
            MessageType::Error => Err(reply.decode::<RpcError>()?.into()),
            other => Err(FrameError::UnexpectedKind(other).into()),
        }
    }

    pub async fn close(&self) {
        if let Some(conn) = self.live.lock().await.take() {
            conn.close(0u32.into(), b"node closing");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.live
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.close_reason().is_none())
    }
}

impl Drop for CirrusClient {
    fn drop(&mut self) {
        if let Ok(mut live) = self.live.try_lock()
            && let Some(conn) = live.take()
        {
            conn.close(0u32.into(), b"client dropped");
        }
    }
}

/// Trusts every server certificate while still checking handshake
/// signatures against the ring provider.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
