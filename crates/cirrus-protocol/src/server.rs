// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listening side of the cirrus QUIC transport.
//!
//! A management node listens here for calls forwarded by its peers. Host
//! agents in the integration tests listen here too, and keep one stream per
//! management node open for commands and notices.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::{ConnectionError, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::frame::{Frame, FrameError, FramedStream, read_frame, write_frame};
use crate::messages::RpcError;

/// Default port for the peer endpoint.
pub const DEFAULT_PEER_PORT: u16 = 8250;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind error: {0}")]
    Bind(#[from] std::io::Error),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Raised by a request handler. The caller receives it as an [`RpcError`]
    /// with the same code.
    #[error("handler error [{code}]: {message}")]
    Handler { code: String, message: String },
}

impl ServerError {
    pub fn handler(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            code: code.into(),
            message: message.into(),
        }
    }

    fn to_rpc_error(&self) -> RpcError {
        let (code, message) = match self {
            Self::Handler { code, message } => (code.clone(), message.clone()),
            other => ("INTERNAL".to_string(), other.to_string()),
        };
        RpcError {
            code,
            message,
            details: String::new(),
        }
    }
}

/// Listener settings. Built from the environment by [`from_env`](Self::from_env).
#[derive(Debug, Clone)]
pub struct CirrusServerConfig {
    pub bind_addr: SocketAddr,
    /// PEM certificate chain.
    pub cert_pem: Vec<u8>,
    /// PEM private key.
    pub key_pem: Vec<u8>,
    /// Handshakes queued by the endpoint before new ones are refused.
    pub max_incoming: usize,
    /// Streams one peer may hold open. Each forwarded call takes one for
    /// its lifetime, an agent channel takes one for the session.
    pub max_streams: u32,
    pub idle_timeout: Duration,
    /// `None` turns keep-alives off.
    pub keep_alive: Option<Duration>,
    /// UDP receive buffer. `None` keeps the OS default.
    pub recv_buffer: Option<usize>,
    /// Connections served at once. `None` is unbounded.
    pub max_connections: Option<usize>,
}

impl Default for CirrusServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PEER_PORT)),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            max_incoming: 1_000,
            max_streams: 256,
            idle_timeout: Duration::from_secs(300),
            keep_alive: Some(Duration::from_secs(15)),
            recv_buffer: Some(1024 * 1024),
            max_connections: None,
        }
    }
}

fn env_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Reads a count or size where `0` means "no setting".
fn env_nonzero(key: &str, default: Option<usize>) -> Option<usize> {
    match env_var::<usize>(key) {
        Some(0) => None,
        Some(n) => Some(n),
        None => default,
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env_var(key).map(Duration::from_millis)
}

impl CirrusServerConfig {
    /// Defaults overridden by the environment:
    ///
    /// | Variable | Meaning | Default |
    /// |---|---|---|
    /// | `CIRRUS_QUIC_MAX_INCOMING` | queued handshakes | 1000 |
    /// | `CIRRUS_QUIC_MAX_STREAMS` | open streams per peer | 256 |
    /// | `CIRRUS_QUIC_IDLE_TIMEOUT_MS` | idle timeout | 300000 |
    /// | `CIRRUS_QUIC_KEEP_ALIVE_MS` | keep-alive interval, 0 for none | 15000 |
    /// | `CIRRUS_QUIC_UDP_RECV_BUFFER` | UDP receive buffer, 0 for OS default | 1048576 |
    /// | `CIRRUS_QUIC_MAX_CONNECTIONS` | connections served at once, 0 for no limit | 0 |
    pub fn from_env() -> Self {
        let default = Self::default();
        let keep_alive = match env_millis("CIRRUS_QUIC_KEEP_ALIVE_MS") {
            Some(d) if d.is_zero() => None,
            Some(d) => Some(d),
            None => default.keep_alive,
        };
        Self {
            max_incoming: env_var("CIRRUS_QUIC_MAX_INCOMING").unwrap_or(default.max_incoming),
            max_streams: env_var("CIRRUS_QUIC_MAX_STREAMS").unwrap_or(default.max_streams),
            idle_timeout: env_millis("CIRRUS_QUIC_IDLE_TIMEOUT_MS").unwrap_or(default.idle_timeout),
            keep_alive,
            recv_buffer: env_nonzero("CIRRUS_QUIC_UDP_RECV_BUFFER", default.recv_buffer),
            max_connections: env_nonzero("CIRRUS_QUIC_MAX_CONNECTIONS", default.max_connections),
            ..default
        }
    }

    fn identity(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
        let chain = rustls_pemfile::certs(&mut self.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ServerError::Tls(format!("failed to parse certificates: {}", e)))?;
        let key = rustls_pemfile::private_key(&mut self.key_pem.as_slice())
            .map_err(|e| ServerError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ServerError::Tls("no private key found".to_string()))?;
        Ok((chain, key))
    }

    fn transport(&self) -> Result<TransportConfig, ServerError> {
        let idle = self
            .idle_timeout
            .try_into()
            .map_err(|e| ServerError::Tls(format!("invalid idle timeout: {}", e)))?;

        let mut transport = TransportConfig::default();
        transport
            .max_idle_timeout(Some(idle))
            .max_concurrent_bidi_streams(self.max_streams.into())
            .max_concurrent_uni_streams(0u32.into())
            .keep_alive_interval(self.keep_alive);
        Ok(transport)
    }

    fn quic_config(&self) -> Result<ServerConfig, ServerError> {
        let (chain, key) = self.identity()?;
        let tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        let mut quic = ServerConfig::with_crypto(Arc::new(crypto));
        quic.transport_config(Arc::new(self.transport()?))
            .max_incoming(self.max_incoming);
        Ok(quic)
    }
}

fn bind_udp(addr: SocketAddr, recv_buffer: Option<usize>) -> std::io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = recv_buffer
        && let Err(e) = socket.set_recv_buffer_size(size)
    {
        warn!(size, error = %e, "UDP receive buffer left at OS default");
    }
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// A bound QUIC listener.
pub struct CirrusServer {
    endpoint: Endpoint,
    max_connections: Option<usize>,
}

impl CirrusServer {
    pub fn new(config: CirrusServerConfig) -> Result<Self, ServerError> {
        let quic = config.quic_config()?;
        let socket = bind_udp(config.bind_addr, config.recv_buffer)?;

        let runtime = quinn::default_runtime()
            .ok_or_else(|| ServerError::Bind(std::io::Error::other("no async runtime found")))?;
        let endpoint = Endpoint::new_with_abstract_socket(
            quinn::EndpointConfig::default(),
            Some(quic),
            runtime.wrap_udp_socket(socket)?,
            runtime,
        )?;

        info!(
            addr = %endpoint.local_addr()?,
            max_streams = config.max_streams,
            max_connections = ?config.max_connections,
            "Listening for QUIC connections"
        );
        Ok(Self {
            endpoint,
            max_connections: config.max_connections,
        })
    }

    /// Listen on `bind_addr` with a fresh self-signed `localhost` certificate.
    pub fn localhost(bind_addr: SocketAddr) -> Result<Self, ServerError> {
        Self::localhost_with_config(bind_addr, CirrusServerConfig::from_env())
    }

    pub fn localhost_with_config(
        bind_addr: SocketAddr,
        config: CirrusServerConfig,
    ) -> Result<Self, ServerError> {
        let identity = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| ServerError::Tls(e.to_string()))?;
        Self::new(CirrusServerConfig {
            bind_addr,
            cert_pem: identity.cert.pem().into_bytes(),
            key_pem: identity.key_pair.serialize_pem().into_bytes(),
            ..config
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Stops listening and closes every connection. [`run`](Self::run) returns.
    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"node closing");
    }

    /// Serve each connection with `serve` on its own task until the
    /// listener is closed.
    ///
    /// With a connection limit, the next handshake is not taken until a
    /// running connection ends. Peers wait in the endpoint's handshake queue
    /// meanwhile.
    #[instrument(skip_all)]
    pub async fn run<H, Fut>(&self, serve: H) -> Result<(), ServerError>
    where
        H: Fn(ConnectionHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let slots = self.max_connections.map(|n| Arc::new(Semaphore::new(n)));

        while let Some(incoming) = self.endpoint.accept().await {
            let slot = match &slots {
                Some(slots) => match slots.clone().acquire_owned().await {
                    Ok(slot) => Some(slot),
                    Err(_) => break,
                },
                None => None,
            };
            let serve = serve.clone();

            tokio::spawn(async move {
                let _slot = slot;
                match incoming.await {
                    Ok(connection) => serve(ConnectionHandler::new(connection)).await,
                    Err(e) => debug!(error = %e, "Handshake failed"),
                }
            });
        }

        debug!("Listener closed");
        Ok(())
    }
}

fn closed_normally(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::TimedOut
    )
}

/// One accepted peer or node connection.
pub struct ConnectionHandler {
    connection: quinn::Connection,
}

impl ConnectionHandler {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Hand every stream the remote opens to `serve` on its own task.
    /// Returns when the connection ends.
    #[instrument(skip_all, fields(remote = %self.remote_address()))]
    pub async fn run<H, Fut>(&self, serve: H)
    where
        H: Fn(StreamHandler) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let ended = loop {
            match self.connection.accept_bi().await {
                Ok((send, recv)) => {
                    tokio::spawn(serve.clone()(StreamHandler::new(send, recv)));
                }
                Err(e) => break e,
            }
        };

        if closed_normally(&ended) {
            debug!(reason = %ended, "Connection ended");
        } else {
            warn!(error = %ended, "Connection lost");
        }
    }
}

/// One bidirectional stream: a single call, or a long-lived channel.
pub struct StreamHandler {
    send: SendStream,
    recv: RecvStream,
}

impl StreamHandler {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        Self { send, recv }
    }

    pub async fn read_frame(&mut self) -> Result<Frame, ServerError> {
        Ok(read_frame(&mut self.recv).await?)
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), ServerError> {
        Ok(write_frame(&mut self.send, frame).await?)
    }

    /// Answer one call on this stream and finish it. A failed handler
    /// is answered with an error frame.
    pub async fn handle_request<Req, Resp, H, Fut>(&mut self, handler: H) -> Result<(), ServerError>
    where
        Req: prost::Message + Default,
        Resp: prost::Message,
        H: FnOnce(Req) -> Fut,
        Fut: std::future::Future<Output = Result<Resp, ServerError>>,
    {
        let request: Req = self.read_frame().await?.decode()?;
        let reply = match handler(request).await {
            Ok(response) => Frame::response(&response)?,
            Err(e) => {
                debug!(error = %e, "Call failed");
                Frame::error(&e.to_rpc_error())?
            }
        };
        self.write_frame(&reply).await?;
        self.finish()
    }

    pub fn into_channel(self) -> (FramedStream<SendStream>, FramedStream<RecvStream>) {
        (FramedStream::new(self.send), FramedStream::new(self.recv))
    }

    pub fn finish(&mut self) -> Result<(), ServerError> {
        self.send
            .finish()
            .map_err(|e| ServerError::Frame(FrameError::Io(std::io::Error::other(e))))
    }
}
