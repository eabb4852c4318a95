//! Connection pool holding one send/receive stub pair per replica.

use crate::endpoint::{
    connect_replica, ReplicaIdx, ReplicaRecvStub, ReplicaSendStub,
};

/// One bidirectional stream per replica. A replica whose connection failed
/// at startup keeps `None` in both slots for the whole run.
pub struct ConnPool {
    /// Send stubs, indexed by replica.
    pub(crate) send_stubs: Vec<Option<ReplicaSendStub>>,

    /// Receive stubs, indexed by replica. A stub is lent to the replica's
    /// reply collector for the duration of a round and handed back in its
    /// completion report.
    pub(crate) recv_stubs: Vec<Option<ReplicaRecvStub>>,
}

impl ConnPool {
    /// Connects to every replica address in order. Connection failures are
    /// logged, not fatal.
    pub async fn connect_all(addrs: &[String], retries: u8) -> Self {
        let mut send_stubs = Vec::with_capacity(addrs.len());
        let mut recv_stubs = Vec::with_capacity(addrs.len());
        for (idx, addr) in addrs.iter().enumerate() {
            match connect_replica(idx, addr, retries).await {
                Ok((send_stub, recv_stub)) => {
                    pf_debug!("connected to replica {} '{}'", idx, addr);
                    send_stubs.push(Some(send_stub));
                    recv_stubs.push(Some(recv_stub));
                }
                Err(e) => {
                    pf_warn!(
                        "error connecting to replica {} '{}': {}",
                        idx,
                        addr,
                        e
                    );
                    send_stubs.push(None);
                    recv_stubs.push(None);
                }
            }
        }
        ConnPool {
            send_stubs,
            recv_stubs,
        }
    }

    /// Number of replicas, connected or not.
    #[inline]
    pub fn population(&self) -> usize {
        self.send_stubs.len()
    }

    /// Returns whether replica `idx` has a live send stub.
    #[inline]
    pub fn is_connected(&self, idx: ReplicaIdx) -> bool {
        self.send_stubs.get(idx).is_some_and(|s| s.is_some())
    }

    /// Takes replica `idx`'s receive stub out of the pool.
    pub(crate) fn lend_recv(
        &mut self,
        idx: ReplicaIdx,
    ) -> Option<ReplicaRecvStub> {
        self.recv_stubs.get_mut(idx).and_then(Option::take)
    }

    /// Puts a receive stub back into its slot.
    pub(crate) fn give_back_recv(&mut self, stub: ReplicaRecvStub) {
        let idx = stub.idx();
        if let Some(slot) = self.recv_stubs.get_mut(idx) {
            *slot = Some(stub);
        }
    }

    /// Closes every connection.
    pub fn close(&mut self) {
        self.send_stubs.clear();
        self.recv_stubs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::LoadError;
    use tokio::net::TcpListener;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_replica_stays_none() -> Result<(), LoadError> {
        let live = TcpListener::bind("127.0.0.1:0").await?;
        let dead = TcpListener::bind("127.0.0.1:0").await?;
        let addrs = vec![
            live.local_addr()?.to_string(),
            dead.local_addr()?.to_string(),
        ];
        drop(dead);
        tokio::spawn(async move {
            let _conn = live.accept().await;
            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        });

        let mut pool = ConnPool::connect_all(&addrs, 0).await;
        assert_eq!(pool.population(), 2);
        assert!(pool.is_connected(0));
        assert!(!pool.is_connected(1));
        assert!(!pool.is_connected(2));

        let stub = pool.lend_recv(0).ok_or(LoadError::msg("no stub"))?;
        assert!(pool.lend_recv(0).is_none());
        assert!(pool.lend_recv(1).is_none());
        pool.give_back_recv(stub);
        assert!(pool.lend_recv(0).is_some());
        Ok(())
    }
}
