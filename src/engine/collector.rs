//! Reply collector: one task per reply source per round, draining exactly
//! its quota of reply records off the source's inbound stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::endpoint::{ReplicaIdx, ReplicaRecvStub, Reply};
use crate::utils::{CommandId, CompletionMap, LoadError, MarkOutcome};

/// Completion token each collector emits exactly once.
pub struct CollectorReport {
    /// Replica this collector read from.
    pub source: ReplicaIdx,

    /// True iff any reply failed to arrive or decode.
    pub errored: bool,

    /// Number of replies carrying a success flag.
    pub successes: u64,

    /// Number of replies decoded.
    pub received: usize,

    /// The receive stub lent for this round, handed back to the pool.
    pub stub: Option<ReplicaRecvStub>,
}

/// Reply collector of one source for one round.
pub(crate) struct ReplyCollector {
    source: ReplicaIdx,
    quota: usize,

    /// First command ID dispatched this round.
    base_id: CommandId,

    stub: Option<ReplicaRecvStub>,
    completion: Option<Arc<CompletionMap>>,
    idle_timeout: Option<Duration>,
}

impl ReplyCollector {
    pub(crate) fn new(
        source: ReplicaIdx,
        quota: usize,
        base_id: CommandId,
        stub: Option<ReplicaRecvStub>,
        completion: Option<Arc<CompletionMap>>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        ReplyCollector {
            source,
            quota,
            base_id,
            stub,
            completion,
            idle_timeout,
        }
    }

    /// Records a reply in the completion map if verification is on.
    fn verify(&self, reply: &Reply) {
        let Some(map) = self.completion.as_ref() else {
            return;
        };
        match map.mark(reply.id) {
            MarkOutcome::First => {}
            MarkOutcome::Duplicate => {
                pf_warn!("duplicate reply {} from replica {}", reply.id, self.source);
            }
            MarkOutcome::OutOfRange => {
                pf_warn!(
                    "reply {} from replica {} out of range (map size {})",
                    reply.id,
                    self.source,
                    map.len()
                );
            }
        }
    }

    /// Waits for the next reply, bounded by the idle timeout if set.
    /// Returns `Ok(None)` on timeout.
    async fn next_reply(
        stub: &mut ReplicaRecvStub,
        idle_timeout: Option<Duration>,
    ) -> Result<Option<Reply>, LoadError> {
        match idle_timeout {
            None => stub.recv_reply().await.map(Some),
            Some(dur) => match time::timeout(dur, stub.recv_reply()).await {
                Ok(reply) => reply.map(Some),
                Err(_) => Ok(None),
            },
        }
    }

    /// Drains the quota and composes the completion report.
    async fn collect(&mut self) -> CollectorReport {
        let mut report = CollectorReport {
            source: self.source,
            errored: false,
            successes: 0,
            received: 0,
            stub: None,
        };
        let Some(mut stub) = self.stub.take() else {
            if self.quota > 0 {
                pf_error!(
                    "replica {} has no connection, {} replies lost",
                    self.source,
                    self.quota
                );
                report.errored = true;
            }
            return report;
        };

        let mut taken = 0;
        while taken < self.quota {
            match Self::next_reply(&mut stub, self.idle_timeout).await {
                Ok(Some(reply)) => {
                    if stub.is_stale() {
                        if reply.id < self.base_id {
                            pf_debug!(
                                "discarding late reply {} from replica {}",
                                reply.id,
                                self.source
                            );
                            continue;
                        }
                        stub.set_stale(false);
                    }
                    taken += 1;
                    report.received += 1;
                    self.verify(&reply);
                    if reply.ok {
                        report.successes += 1;
                    }
                }
                Ok(None) => {
                    pf_error!(
                        "timed out waiting on replica {}, {} replies outstanding",
                        self.source,
                        self.quota - taken
                    );
                    // replies still in flight belong to this round
                    stub.set_stale(true);
                    report.errored = true;
                    break;
                }
                Err(e) if stub.is_closed() => {
                    pf_error!(
                        "error reading from replica {}: {}; {} replies lost",
                        self.source,
                        e,
                        self.quota - taken
                    );
                    report.errored = true;
                    break;
                }
                Err(e) => {
                    pf_error!("error reading from replica {}: {}", self.source, e);
                    taken += 1;
                    report.errored = true;
                }
            }
        }

        pf_debug!(
            "collector for replica {} done: {}/{} received, {} successful",
            self.source,
            report.received,
            self.quota,
            report.successes
        );
        report.stub = Some(stub);
        report
    }

    /// Runs the collector to completion and emits its report on `tx_done`.
    pub(crate) async fn run(mut self, tx_done: mpsc::Sender<CollectorReport>) {
        let report = self.collect().await;
        if tx_done.send(report).await.is_err() {
            pf_error!(
                "completion channel closed before replica {} reported",
                self.source
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{connect_replica, REPLY_LEN};
    use bytes::{BufMut, BytesMut};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Connects a receive stub to a server that writes `bytes` then keeps
    /// the connection open for `linger`.
    async fn stub_fed_with(
        bytes: BytesMut,
        linger: Duration,
    ) -> Result<ReplicaRecvStub, LoadError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await?;
            conn.write_all(&bytes).await?;
            time::sleep(linger).await;
            Ok::<(), LoadError>(())
        });
        let (_send, recv) = connect_replica(0, &addr, 0).await?;
        Ok(recv)
    }

    fn replies(ids: &[i32], ok: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        for &id in ids {
            Reply {
                id,
                ok,
                value: 0,
                timestamp: 0,
            }
            .encode(&mut buf);
        }
        buf
    }

    async fn run_one(collector: ReplyCollector) -> Result<CollectorReport, LoadError> {
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(collector.run(tx));
        rx.recv().await.ok_or(LoadError::msg("no report"))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clean_quota_marks_map() -> Result<(), LoadError> {
        let stub =
            stub_fed_with(replies(&[0, 1, 2, 3], true), Duration::from_secs(1))
                .await?;
        let map = Arc::new(CompletionMap::new(4));
        let report =
            run_one(ReplyCollector::new(0, 4, 0, Some(stub), Some(map.clone()), None))
                .await?;
        assert!(!report.errored);
        assert_eq!(report.received, 4);
        assert_eq!(report.successes, 4);
        assert!(report.stub.is_some());
        assert!(map.unseen_in(0..4).is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_reply_keeps_draining() -> Result<(), LoadError> {
        let mut bytes = replies(&[0], true);
        bytes.put_u8(5); // bad success flag
        bytes.put_bytes(0, REPLY_LEN - 1);
        bytes.extend_from_slice(&replies(&[2], false));
        let stub = stub_fed_with(bytes, Duration::from_secs(1)).await?;
        let map = Arc::new(CompletionMap::new(3));
        let report =
            run_one(ReplyCollector::new(0, 3, 0, Some(stub), Some(map.clone()), None))
                .await?;
        assert!(report.errored);
        assert_eq!(report.received, 2);
        assert_eq!(report.successes, 1);
        assert_eq!(map.unseen_in(0..3), vec![1]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicates_and_out_of_range_not_fatal() -> Result<(), LoadError> {
        let stub =
            stub_fed_with(replies(&[0, 0, 9], true), Duration::from_secs(1))
                .await?;
        let map = Arc::new(CompletionMap::new(2));
        let report =
            run_one(ReplyCollector::new(0, 3, 0, Some(stub), Some(map.clone()), None))
                .await?;
        assert!(!report.errored);
        assert_eq!(report.successes, 3);
        assert_eq!(map.count_seen(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn closed_connection_charges_rest() -> Result<(), LoadError> {
        let stub = stub_fed_with(replies(&[0, 1], true), Duration::ZERO).await?;
        let report =
            run_one(ReplyCollector::new(0, 10, 0, Some(stub), None, None)).await?;
        assert!(report.errored);
        assert_eq!(report.received, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_timeout_reports_error() -> Result<(), LoadError> {
        let stub =
            stub_fed_with(replies(&[0], true), Duration::from_secs(2)).await?;
        let report = run_one(ReplyCollector::new(
            0,
            2,
            0,
            Some(stub),
            None,
            Some(Duration::from_millis(100)),
        ))
        .await?;
        assert!(report.errored);
        assert_eq!(report.received, 1);
        assert!(report.stub.is_some_and(|stub| stub.is_stale()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_stub_skips_late_replies() -> Result<(), LoadError> {
        let mut stub = stub_fed_with(
            replies(&[3, 4, 10, 11], true),
            Duration::from_secs(1),
        )
        .await?;
        stub.set_stale(true);
        let map = Arc::new(CompletionMap::new(12));
        let report = run_one(ReplyCollector::new(
            0,
            2,
            10,
            Some(stub),
            Some(map.clone()),
            None,
        ))
        .await?;
        assert!(!report.errored);
        assert_eq!(report.received, 2);
        assert_eq!(map.unseen_in(0..12).len(), 10);
        assert!(map.is_seen(10)? && map.is_seen(11)?);
        assert!(!map.is_seen(3)? && !map.is_seen(4)?);
        assert!(report.stub.is_some_and(|stub| !stub.is_stale()));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fresh_stub_counts_carried_replies() -> Result<(), LoadError> {
        let stub =
            stub_fed_with(replies(&[3, 4], true), Duration::from_secs(1))
                .await?;
        let report =
            run_one(ReplyCollector::new(0, 2, 10, Some(stub), None, None))
                .await?;
        assert!(!report.errored);
        assert_eq!(report.received, 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_stub() -> Result<(), LoadError> {
        let report = run_one(ReplyCollector::new(1, 5, 0, None, None, None)).await?;
        assert!(report.errored);
        assert_eq!(report.source, 1);
        let report = run_one(ReplyCollector::new(1, 0, 0, None, None, None)).await?;
        assert!(!report.errored);
        Ok(())
    }
}
