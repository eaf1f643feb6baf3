//! Live session boundary
//!
//! The player executes decoded operations through a [`Session`]; how bytes
//! reach a server is the session's business. The default implementation
//! speaks the wire protocol over a plain TCP socket, assigning fresh
//! request ids and pairing the server's reply frames by `response_to`.

use crate::error::{PlayerError, Result};
use crate::protocol::{MsgHeader, Op, Replyable, HEADER_LEN, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// What came back from dispatching one operation
#[derive(Debug, Clone, Default)]
pub struct WireResponse {
    /// Round-trip latency of the dispatch
    pub latency: Duration,
    /// Cursor id the live server assigned, if the reply defined one
    pub cursor_id: Option<i64>,
    /// Documents the reply carried
    pub num_returned: i32,
    /// Error messages embedded in the reply
    pub errors: Vec<String>,
}

/// One live connection to the replay target
#[async_trait]
pub trait Session: Send {
    /// Execute a decoded op; `Ok(None)` for fire-and-forget operations
    async fn execute(&mut self, op: &Op) -> Result<Option<WireResponse>>;
}

/// Opens sessions for replay workers
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Session>>;
}

/// Factory for [`TcpSession`]s against one target address
pub struct TcpSessionFactory {
    address: String,
}

impl TcpSessionFactory {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for TcpSessionFactory {
    async fn connect(&self) -> Result<Box<dyn Session>> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| PlayerError::connect_failed(&self.address, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| PlayerError::connect_failed(&self.address, e.to_string()))?;
        debug!(target = %self.address, "session connected");
        Ok(Box::new(TcpSession {
            stream,
            next_request_id: 1,
        }))
    }
}

/// Raw wire-protocol session over TCP
pub struct TcpSession {
    stream: TcpStream,
    next_request_id: i32,
}

impl TcpSession {
    fn fresh_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.checked_add(1).unwrap_or(1);
        id
    }

    async fn read_frame(&mut self) -> Result<(MsgHeader, Vec<u8>)> {
        let mut header_bytes = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header_bytes).await?;
        let Some(header) = MsgHeader::parse(&header_bytes) else {
            return Err(PlayerError::Message("short reply header".to_string()).into());
        };
        if header.message_length < HEADER_LEN as i32 || header.message_length > MAX_MESSAGE_SIZE {
            return Err(PlayerError::Message(format!(
                "reply frame with invalid length {}",
                header.message_length
            ))
            .into());
        }
        let mut body = vec![0u8; header.body_len()];
        self.stream.read_exact(&mut body).await?;
        Ok((header, body))
    }
}

#[async_trait]
impl Session for TcpSession {
    async fn execute(&mut self, op: &Op) -> Result<Option<WireResponse>> {
        let request_id = self.fresh_request_id();
        let message = op.encode_message(request_id, 0)?;

        let start = tokio::time::Instant::now();
        self.stream.write_all(&message).await?;

        if !op.expects_reply() {
            trace!(opcode = %op.opcode(), "dispatched without reply");
            return Ok(None);
        }

        loop {
            let (header, body) = self.read_frame().await?;
            if header.response_to != request_id {
                // stale frame from an earlier exchange; skip it
                trace!(
                    response_to = header.response_to,
                    expected = request_id,
                    "discarding unmatched reply frame"
                );
                continue;
            }
            let latency = start.elapsed();
            let reply = Op::decode(&header, &body)?;
            let response = match reply.replyable() {
                Some(replyable) => WireResponse {
                    latency,
                    cursor_id: replyable.cursor_id(),
                    num_returned: replyable.num_returned(),
                    errors: replyable.error_messages(),
                },
                None => WireResponse {
                    latency,
                    ..WireResponse::default()
                },
            };
            return Ok(Some(response));
        }
    }
}
