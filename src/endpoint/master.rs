//! Coordination service ("master") client stub.
//!
//! The master speaks Go-style JSON-RPC 1.0 over a plain TCP connection: each
//! call is one newline-terminated JSON object
//! `{"method": .., "params": [args], "id": n}` answered by one
//! newline-terminated `{"id": n, "result": .., "error": ..}` object.

use async_trait::async_trait;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{self, Duration};

use crate::endpoint::ReplicaIdx;
use crate::utils::{tcp_connect_with_retry, LoadError};

/// Replica discovery and leader queries offered by the coordination service.
#[async_trait]
pub trait MasterApi: Send {
    /// Returns the network addresses of all replicas, in index order.
    async fn get_replica_list(&mut self) -> Result<Vec<String>, LoadError>;

    /// Returns the index of the replica currently believed to be leader.
    async fn get_leader(&mut self) -> Result<ReplicaIdx, LoadError>;
}

/// Empty argument object of both master calls.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EmptyArgs {}

/// Result object of `Master.GetReplicaList`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ReplicaListReply {
    #[serde(rename = "ReplicaList", default)]
    pub replica_list: Vec<String>,
    #[serde(rename = "Ready", default)]
    pub ready: bool,
}

/// Result object of `Master.GetLeader`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LeaderReply {
    #[serde(rename = "LeaderId")]
    pub leader_id: i64,
}

/// JSON-RPC call envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest<A> {
    pub method: String,
    pub params: [A; 1],
    pub id: u64,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<R> {
    pub id: u64,
    pub result: Option<R>,
    pub error: Option<String>,
}

/// Master connection stub.
pub struct MasterStub {
    /// Master address, for logging.
    addr: String,

    /// Buffered read-half split of the TCP connection stream.
    conn_read: BufReader<OwnedReadHalf>,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Response line buffer.
    line_buf: String,

    /// Next call sequence number.
    next_seq: u64,

    /// Number of extra polls while the master reports not ready.
    ready_retries: u8,

    /// Pause between readiness polls.
    ready_interval: Duration,
}

impl MasterStub {
    /// Connects to the master at `addr`.
    pub async fn new_by_connect(
        addr: &str,
        retries: u8,
    ) -> Result<Self, LoadError> {
        pf_info!("connecting to master '{}'...", addr);
        let stream = tcp_connect_with_retry(addr, retries).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(MasterStub {
            addr: addr.into(),
            conn_read: BufReader::new(read_half),
            conn_write: write_half,
            line_buf: String::new(),
            next_seq: 0,
            ready_retries: retries,
            ready_interval: Duration::from_secs(1),
        })
    }

    /// Issues one call and waits for its response.
    async fn call<A, R>(
        &mut self,
        method: &str,
        args: A,
    ) -> Result<R, LoadError>
    where
        A: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        let req = RpcRequest {
            method: method.into(),
            params: [args],
            id: seq,
        };
        let mut req_bytes = serde_json::to_vec(&req)?;
        req_bytes.push(b'\n');
        self.conn_write.write_all(&req_bytes).await?;

        self.line_buf.clear();
        if self.conn_read.read_line(&mut self.line_buf).await? == 0 {
            return logged_err!(
                "master '{}' closed connection during {}",
                self.addr,
                method
            );
        }
        let resp: RpcResponse<R> = serde_json::from_str(&self.line_buf)?;
        if resp.id != seq {
            return logged_err!(
                "{} response sequence mismatch: expect {} got {}",
                method,
                seq,
                resp.id
            );
        }
        match (resp.result, resp.error) {
            (_, Some(err)) => logged_err!("{} failed: {}", method, err),
            (Some(result), None) => Ok(result),
            (None, None) => logged_err!("{} returned no result", method),
        }
    }
}

#[async_trait]
impl MasterApi for MasterStub {
    async fn get_replica_list(&mut self) -> Result<Vec<String>, LoadError> {
        let mut polls: u16 = 0;
        loop {
            let reply: ReplicaListReply =
                self.call("Master.GetReplicaList", EmptyArgs {}).await?;
            if reply.ready && !reply.replica_list.is_empty() {
                return Ok(reply.replica_list);
            }
            if polls >= u16::from(self.ready_retries) {
                return logged_err!(
                    "master '{}' cluster not ready after {} polls",
                    self.addr,
                    polls + 1
                );
            }
            polls += 1;
            pf_warn!("master reports cluster not ready, polling again...");
            time::sleep(self.ready_interval).await;
        }
    }

    async fn get_leader(&mut self) -> Result<ReplicaIdx, LoadError> {
        let reply: LeaderReply =
            self.call("Master.GetLeader", EmptyArgs {}).await?;
        ReplicaIdx::try_from(reply.leader_id).map_err(|_| {
            LoadError::msg(format!("invalid leader ID {}", reply.leader_id))
        })
    }
}
