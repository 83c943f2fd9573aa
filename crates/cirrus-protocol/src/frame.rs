// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for agent and peer streams.
//!
//! Every message travels in a frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: frame kind
//! - N bytes: protobuf payload
//!
//! Peer calls use one QUIC stream per request. The agent channel keeps a single
//! long-lived stream per host, so both halves can be framed independently with
//! [`FramedStream`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MB). Agent commands are small; the cap bounds memory
/// per connection when a peer misbehaves.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes kind)
pub const HEADER_SIZE: usize = 6;

/// Frame kinds on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// A request that expects a correlated reply
    Request = 1,
    /// A reply to a request
    Response = 2,
    /// Unsolicited message (startup, shutdown notice)
    Notice = 3,
    /// Error reply
    Error = 4,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::Notice),
            4 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected frame kind: {0:?}")]
    UnexpectedKind(MessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with kind and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    pub fn notice<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Notice, msg)
    }

    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    /// Create a new frame with the given kind and message
    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec over a stream or one half of it
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read the next frame and decode it, accepting only the given kind.
    pub async fn read_message<M: Message + Default>(
        &mut self,
        expected: MessageType,
    ) -> Result<M, FrameError> {
        let frame = self.read_frame().await?;
        if frame.message_type != expected {
            return Err(FrameError::UnexpectedKind(frame.message_type));
        }
        frame.decode()
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    pub async fn send_request<M: Message>(&mut self, msg: &M) -> Result<(), FrameError> {
        self.write_frame(&Frame::request(msg)?).await
    }

    pub async fn send_notice<M: Message>(&mut self, msg: &M) -> Result<(), FrameError> {
        self.write_frame(&Frame::notice(msg)?).await
    }

    pub async fn respond<Resp: Message>(&mut self, response: &Resp) -> Result<(), FrameError> {
        self.write_frame(&Frame::response(response)?).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Send a request and wait for its response on the same stream
    pub async fn request<Req: Message, Resp: Message + Default>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, FrameError> {
        self.send_request(request).await?;

        let response_frame = self.read_frame().await?;
        match response_frame.message_type {
            MessageType::Response => response_frame.decode(),
            other => Err(FrameError::UnexpectedKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AgentRequest, Command};

    #[test]
    fn test_frame_encode_decode() {
        let msg = AgentRequest {
            host_id: 7,
            sequence: 42,
            commands: vec![Command::new("ping", Vec::new())],
            stop_on_error: true,
        };
        let frame = Frame::request(&msg).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Request);
        let back: AgentRequest = decoded.decode().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_header_is_length_then_kind() {
        let frame = Frame {
            message_type: MessageType::Notice,
            payload: Bytes::from_static(b"abc"),
        };
        let encoded = frame.encode();
        assert_eq!(&encoded[..HEADER_SIZE], &[0, 0, 0, 3, 0, 3]);
        assert_eq!(&encoded[HEADER_SIZE..], b"abc");
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(MessageType::Request as u16);
        buf.put_slice(b"short");
        assert!(Frame::decode_from_bytes(buf.freeze()).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u16(MessageType::Request as u16);
        let err = Frame::decode_from_bytes(buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_read_eof_reports_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut framed = FramedStream::new(server);
        let err = framed.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_read_message_checks_kind() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FramedStream::new(client);
        let mut reader = FramedStream::new(server);

        let msg = Command::new("ping", Vec::new());
        writer.send_notice(&msg).await.unwrap();

        let err = reader
            .read_message::<Command>(MessageType::Response)
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedKind(MessageType::Notice)));
    }

    #[tokio::test]
    async fn test_request_response_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        let responder = tokio::spawn(async move {
            let req: Command = server.read_message(MessageType::Request).await.unwrap();
            server
                .respond(&Command::new(format!("{}-ack", req.name), Vec::new()))
                .await
                .unwrap();
        });

        let resp: Command = client
            .request(&Command::new("status", Vec::new()))
            .await
            .unwrap();
        assert_eq!(resp.name, "status-ack");
        responder.await.unwrap();
    }
}
