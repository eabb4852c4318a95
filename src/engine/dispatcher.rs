//! Request dispatcher: writes every request of a round to its target
//! replica(s) without waiting on replies.

use bytes::BytesMut;

use crate::endpoint::{ReplicaIdx, Request, RequestSink};

/// Routing policy, fixed for a run.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RoutingMode {
    /// Every request goes to the current leader.
    SingleLeader,
    /// Every request goes to every replica, flushed immediately.
    FastBroadcast,
    /// Every request goes to its pre-drawn random replica.
    LeaderlessRandom,
}

impl RoutingMode {
    /// Picks the routing mode from command line flags. Fast-broadcast takes
    /// precedence over leaderless.
    pub fn from_flags(leaderless: bool, fast: bool) -> Self {
        if fast {
            RoutingMode::FastBroadcast
        } else if leaderless {
            RoutingMode::LeaderlessRandom
        } else {
            RoutingMode::SingleLeader
        }
    }

    /// Returns true if this mode awaits replies from the leader only.
    #[inline]
    pub fn uses_leader(self) -> bool {
        self != RoutingMode::LeaderlessRandom
    }
}

/// Destination of one request.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Target {
    One(ReplicaIdx),
    All,
}

/// Per-round dispatch bookkeeping.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DispatchStats {
    /// Number of requests handled.
    pub sent: usize,
    /// Number of frames dropped because the endpoint is dead or failed.
    pub dropped: usize,
}

/// Request dispatcher.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    /// Flush every outbound buffer after this many requests.
    flush_interval: usize,

    /// Encoding buffer reused across requests.
    frame_buf: BytesMut,
}

impl Dispatcher {
    pub(crate) fn new(flush_interval: usize) -> Self {
        Dispatcher {
            flush_interval: flush_interval.max(1),
            frame_buf: BytesMut::with_capacity(64),
        }
    }

    /// Writes one frame to replica `idx`. A dead endpoint or a failing write
    /// is logged once per round and the frame counted as dropped.
    async fn write_one<S: RequestSink>(
        sinks: &mut [Option<S>],
        failed: &mut [bool],
        stats: &mut DispatchStats,
        idx: ReplicaIdx,
        frame: &[u8],
        flush: bool,
    ) {
        if failed[idx] {
            stats.dropped += 1;
            return;
        }
        let Some(sink) = sinks[idx].as_mut() else {
            pf_error!("replica {} has no connection, dropping writes", idx);
            failed[idx] = true;
            stats.dropped += 1;
            return;
        };

        let mut res = sink.send_frame(frame).await;
        if res.is_ok() && flush {
            res = sink.flush().await;
        }
        if let Err(e) = res {
            pf_error!("error writing to replica {}: {}", idx, e);
            failed[idx] = true;
            stats.dropped += 1;
        }
    }

    /// Flushes every live outbound buffer.
    async fn flush_all<S: RequestSink>(
        sinks: &mut [Option<S>],
        failed: &mut [bool],
    ) {
        for (idx, slot) in sinks.iter_mut().enumerate() {
            if failed[idx] {
                continue;
            }
            if let Some(sink) = slot.as_mut() {
                if let Err(e) = sink.flush().await {
                    pf_error!("error flushing replica {}: {}", idx, e);
                    failed[idx] = true;
                }
            }
        }
    }

    /// Dispatches a round's requests in order. Outbound buffers are flushed
    /// every `flush_interval` requests and once more at the end.
    pub(crate) async fn dispatch<S, I>(
        &mut self,
        sinks: &mut [Option<S>],
        reqs: I,
    ) -> DispatchStats
    where
        S: RequestSink,
        I: IntoIterator<Item = (Request, Target)>,
    {
        let population = sinks.len();
        let mut stats = DispatchStats {
            sent: 0,
            dropped: 0,
        };
        let mut failed = vec![false; population];

        for (req, target) in reqs {
            pf_trace!("sending proposal {} to {:?}", req.id, target);
            self.frame_buf.clear();
            req.encode_propose(&mut self.frame_buf);

            match target {
                Target::One(idx) if idx < population => {
                    Self::write_one(
                        sinks,
                        &mut failed,
                        &mut stats,
                        idx,
                        &self.frame_buf,
                        false,
                    )
                    .await;
                }
                Target::One(idx) => {
                    pf_error!("proposal {} routed to unknown replica {}", req.id, idx);
                    stats.dropped += 1;
                }
                Target::All => {
                    for idx in 0..population {
                        Self::write_one(
                            sinks,
                            &mut failed,
                            &mut stats,
                            idx,
                            &self.frame_buf,
                            true,
                        )
                        .await;
                    }
                }
            }

            stats.sent += 1;
            if stats.sent % self.flush_interval == 0 {
                Self::flush_all(sinks, &mut failed).await;
            }
        }

        Self::flush_all(sinks, &mut failed).await;
        stats
    }
}
