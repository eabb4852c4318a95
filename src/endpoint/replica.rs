//! Replica connection stubs and the proposal/reply wire codec.
//!
//! Every integer on the wire is little-endian. A proposal is a one-byte
//! message-type tag followed by a fixed-size body:
//!
//! ```text
//! tag:u8 | cmd_id:i32 | op:u8 | key:i64 | value:i64 | timestamp:i64
//! ```
//!
//! and a reply is the fixed-size record
//!
//! ```text
//! ok:u8 | cmd_id:i32 | value:i64 | timestamp:i64
//! ```

use async_trait::async_trait;

use bytes::{Buf, BufMut, BytesMut};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::utils::{
    safe_tcp_read_frame, tcp_connect_with_retry, CommandId, LoadError,
};
use crate::workload::Op;

/// Zero-based replica index, assigned in coordination service list order.
pub type ReplicaIdx = usize;

/// Message-type tag of a client proposal.
pub const PROPOSE: u8 = 0;

/// Length of an encoded proposal body, excluding the tag byte.
pub const REQUEST_BODY_LEN: usize = 4 + 1 + 8 + 8 + 8;

/// Length of an encoded reply record.
pub const REPLY_LEN: usize = 1 + 4 + 8 + 8;

/// Client request record. Immutable once generated.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Request {
    pub id: CommandId,
    pub op: Op,
    pub key: i64,
    pub value: i64,
    pub round: usize,
}

impl Request {
    /// Appends the tag byte and the encoded body to `buf`.
    pub fn encode_propose(&self, buf: &mut BytesMut) {
        buf.reserve(1 + REQUEST_BODY_LEN);
        buf.put_u8(PROPOSE);
        buf.put_i32_le(self.id);
        buf.put_u8(self.op.code());
        buf.put_i64_le(self.key);
        buf.put_i64_le(self.value);
        buf.put_i64_le(0); // timestamp slot, unused by this client
    }

    /// Decodes a proposal body (tag byte already consumed). The round is not
    /// carried on the wire and decodes as 0.
    pub fn decode_body(mut body: &[u8]) -> Result<Self, LoadError> {
        if body.len() < REQUEST_BODY_LEN {
            return Err(LoadError::msg(format!(
                "proposal body too short: {} bytes",
                body.len()
            )));
        }
        let id = body.get_i32_le();
        let code = body.get_u8();
        let op = Op::from_code(code).ok_or_else(|| {
            LoadError::msg(format!("unknown op code {}", code))
        })?;
        let key = body.get_i64_le();
        let value = body.get_i64_le();
        Ok(Request {
            id,
            op,
            key,
            value,
            round: 0,
        })
    }
}

/// Reply record produced by a replica for exactly one proposal.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Reply {
    pub id: CommandId,
    pub ok: bool,
    pub value: i64,
    pub timestamp: i64,
}

impl Reply {
    /// Appends the encoded reply record to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(REPLY_LEN);
        buf.put_u8(u8::from(self.ok));
        buf.put_i32_le(self.id);
        buf.put_i64_le(self.value);
        buf.put_i64_le(self.timestamp);
    }

    /// Decodes a reply record. A success flag other than 0 or 1 marks the
    /// record as malformed.
    pub fn decode(mut frame: &[u8]) -> Result<Self, LoadError> {
        if frame.len() < REPLY_LEN {
            return Err(LoadError::msg(format!(
                "reply record too short: {} bytes",
                frame.len()
            )));
        }
        let ok = match frame.get_u8() {
            0 => false,
            1 => true,
            flag => {
                return Err(LoadError::msg(format!(
                    "malformed reply success flag {}",
                    flag
                )))
            }
        };
        let id = frame.get_i32_le();
        let value = frame.get_i64_le();
        let timestamp = frame.get_i64_le();
        Ok(Reply {
            id,
            ok,
            value,
            timestamp,
        })
    }
}

/// Outbound side of a replica connection as seen by the dispatcher.
#[async_trait]
pub trait RequestSink: Send {
    /// Buffers an already encoded proposal frame.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LoadError>;

    /// Pushes everything buffered so far onto the connection.
    async fn flush(&mut self) -> Result<(), LoadError>;
}

/// Replica send stub that owns a buffered TCP write half.
pub struct ReplicaSendStub {
    /// Index of the replica this stub writes to.
    idx: ReplicaIdx,

    /// Buffered write-half split of the TCP connection stream.
    conn_write: BufWriter<OwnedWriteHalf>,
}

impl ReplicaSendStub {
    fn new(idx: ReplicaIdx, conn_write: OwnedWriteHalf) -> Self {
        ReplicaSendStub {
            idx,
            conn_write: BufWriter::new(conn_write),
        }
    }

    #[inline]
    pub fn idx(&self) -> ReplicaIdx {
        self.idx
    }
}

#[async_trait]
impl RequestSink for ReplicaSendStub {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LoadError> {
        self.conn_write.write_all(frame).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), LoadError> {
        self.conn_write.flush().await?;
        Ok(())
    }
}

/// Replica receive stub that owns a TCP read half.
pub struct ReplicaRecvStub {
    /// Index of the replica this stub reads from.
    idx: ReplicaIdx,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Reply read buffer for cancellation safety.
    reply_buf: BytesMut,

    /// Set once a read fails at the transport level.
    closed: bool,

    /// Set when a collector gave up on this stream with replies still in
    /// flight; those replies precede the next round's.
    stale: bool,
}

impl ReplicaRecvStub {
    fn new(idx: ReplicaIdx, conn_read: OwnedReadHalf) -> Self {
        ReplicaRecvStub {
            idx,
            conn_read,
            reply_buf: BytesMut::with_capacity(64 * REPLY_LEN),
            closed: false,
            stale: false,
        }
    }

    #[inline]
    pub fn idx(&self) -> ReplicaIdx {
        self.idx
    }

    /// Returns true if the connection has failed or been closed by the peer;
    /// every further read will fail too.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true if replies of an abandoned round may still be queued
    /// ahead on this stream.
    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    #[inline]
    pub(crate) fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    /// Receives the next reply record. Cancellation-safe: a partially read
    /// record is kept for the next call. A record that arrives whole but
    /// fails to decode has been consumed, so the next call starts at the
    /// record after it.
    pub async fn recv_reply(&mut self) -> Result<Reply, LoadError> {
        let frame = match safe_tcp_read_frame(
            &mut self.reply_buf,
            &mut self.conn_read,
            REPLY_LEN,
        )
        .await
        {
            Ok(frame) => frame,
            Err(e) => {
                self.closed = true;
                return Err(e);
            }
        };
        Reply::decode(&frame)
    }
}

/// Connects to replica `idx` at `addr`, returning its split send and receive
/// stubs.
pub async fn connect_replica(
    idx: ReplicaIdx,
    addr: &str,
    retries: u8,
) -> Result<(ReplicaSendStub, ReplicaRecvStub), LoadError> {
    let stream = tcp_connect_with_retry(addr, retries).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        ReplicaSendStub::new(idx, write_half),
        ReplicaRecvStub::new(idx, read_half),
    ))
}
