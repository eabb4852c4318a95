//! Round controller: orchestrates rounds of dispatch and reply collection,
//! and applies failover policy between rounds.

use std::sync::Arc;

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::endpoint::{
    ConnPool, MasterApi, ReplicaIdx, Request, REQUEST_BODY_LEN,
};
use crate::engine::{
    BenchMetrics, BenchSummary, CollectorReport, DispatchStats, Dispatcher,
    ReplyCollector, RoutingMode, Target,
};
use crate::utils::{CommandId, CompletionMap, LoadError};
use crate::workload::{KeyDist, Workload, WorkloadParams};

/// Engine tunables, parsed from the `--params` TOML string.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct BenchParams {
    /// Flush all outbound buffers every this many requests.
    pub flush_interval: usize,

    /// Seed of the workload RNG.
    pub seed: u64,

    /// Key used by conflicting requests.
    pub hot_key: i64,

    /// Key of slot 0 among non-conflicting requests.
    pub key_base: i64,

    /// Idle timeout of a reply collector in millisecs; 0 waits forever.
    pub reply_timeout_ms: u64,

    /// Retries when connecting to the master or replicas, and polls while
    /// the master reports the cluster not ready.
    pub connect_retries: u8,
}

impl Default for BenchParams {
    fn default() -> Self {
        BenchParams {
            flush_interval: 100,
            seed: 42,
            hot_key: 42,
            key_base: 43,
            reply_timeout_ms: 0,
            connect_retries: 3,
        }
    }
}

impl BenchParams {
    /// Parses from an optional TOML string on top of defaults.
    pub fn from_toml(params_str: Option<&str>) -> Result<Self, LoadError> {
        let params = parsed_config!(params_str => BenchParams;
                                    flush_interval, seed, hot_key, key_base,
                                    reply_timeout_ms, connect_retries)?;
        if params.flush_interval == 0 {
            return logged_err!(
                "invalid params.flush_interval '{}'",
                params.flush_interval
            );
        }
        Ok(params)
    }
}

/// Complete run configuration.
#[derive(Debug, PartialEq, Clone)]
pub struct BenchConfig {
    /// Total number of awaited requests across all rounds.
    pub nreq: usize,

    /// Percentage of writes.
    pub writes: u8,

    /// Routing mode.
    pub mode: RoutingMode,

    /// Number of rounds.
    pub rounds: usize,

    /// Track every command ID for missing or duplicate replies.
    pub check: bool,

    /// Extra requests sent per round that are not waited for.
    pub eps: usize,

    /// Key popularity model.
    pub dist: KeyDist,

    /// Engine tunables.
    pub params: BenchParams,
}

impl BenchConfig {
    /// Replies awaited per round.
    #[inline]
    pub fn per_round(&self) -> usize {
        self.nreq / self.rounds.max(1)
    }

    /// Requests sent per round, including the extra `eps` ones.
    #[inline]
    pub fn slots_per_round(&self) -> usize {
        self.per_round() + self.eps
    }

    /// Checks the configuration for errors that must stop the run before
    /// any network activity.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.nreq == 0 {
            return logged_err!("invalid number of requests {}", self.nreq);
        }
        if self.rounds == 0 || self.rounds > self.nreq {
            return logged_err!(
                "invalid number of rounds {} for {} requests",
                self.rounds,
                self.nreq
            );
        }
        if self.writes > 100 {
            return logged_err!("invalid writes percentage {}", self.writes);
        }
        match self.dist {
            KeyDist::Conflict { conflicts } if conflicts > 100 => {
                return logged_err!("invalid conflicts percentage {}", conflicts);
            }
            KeyDist::Zipfian { s, v } if s <= 1.0 || v < 1.0 => {
                return logged_err!("invalid Zipfian parameters s = {}, v = {}", s, v);
            }
            _ => {}
        }
        if self.params.flush_interval == 0 {
            return logged_err!("invalid flush interval 0");
        }
        let total_ids = self.rounds as u128 * self.slots_per_round() as u128;
        if total_ids > CommandId::MAX as u128 {
            return logged_err!("{} commands overflow the command ID space", total_ids);
        }
        Ok(())
    }
}

/// Phases of the per-round state machine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RoundPhase {
    Idle,
    Dispatching,
    AwaitingReplies,
    Failover,
    Done,
}

/// Explicit state of one round.
#[derive(Debug)]
struct RoundState {
    round: usize,

    /// First command ID of the round.
    base_id: usize,

    /// (source, expected reply count) of every collector started.
    sources: Vec<(ReplicaIdx, usize)>,

    /// Successful replies per source, in `sources` order.
    successes: Vec<u64>,

    /// Sources whose collector reported an error.
    errored: Vec<ReplicaIdx>,

    elapsed: Duration,
}

/// The dispatch/collection/failover engine.
pub struct RoundController<M: MasterApi> {
    /// Run configuration.
    config: BenchConfig,

    /// Coordination service stub.
    master: M,

    /// Replica connections.
    pool: ConnPool,

    /// Pre-generated request slots, replayed every round.
    workload: Workload,

    /// Request dispatcher.
    dispatcher: Dispatcher,

    /// Currently believed leader.
    leader: ReplicaIdx,

    /// Replicas not excluded by leaderless failover.
    active: Vec<bool>,

    /// Run-wide completion map, present iff verification is on.
    completion: Option<Arc<CompletionMap>>,

    /// Next command ID to assign.
    next_cmd: CommandId,

    /// Run statistics.
    metrics: BenchMetrics,

    /// Current state machine phase.
    phase: RoundPhase,
}

impl<M: MasterApi> RoundController<M> {
    /// Validates the configuration, discovers replicas through the master,
    /// generates the workload, and connects to every replica.
    pub async fn new_and_setup(
        config: BenchConfig,
        mut master: M,
    ) -> Result<Self, LoadError> {
        config.validate()?;

        let addrs = master.get_replica_list().await?;
        if addrs.is_empty() {
            return logged_err!("master returned an empty replica list");
        }
        pf_info!("discovered {} replicas: {:?}", addrs.len(), addrs);

        let workload = Workload::generate(&WorkloadParams {
            per_round: config.per_round(),
            eps: config.eps,
            dist: config.dist,
            writes: config.writes,
            population: addrs.len(),
            seed: config.params.seed,
            hot_key: config.params.hot_key,
            key_base: config.params.key_base,
        })?;
        match config.dist {
            KeyDist::Conflict { conflicts } => {
                pf_info!("uniform distribution, {}% conflicts", conflicts)
            }
            KeyDist::Zipfian { s, v } => {
                pf_info!("Zipfian distribution, s = {}, v = {}", s, v)
            }
        }

        let pool =
            ConnPool::connect_all(&addrs, config.params.connect_retries).await;

        let leader = if config.mode.uses_leader() {
            let leader = master.get_leader().await?;
            if leader >= addrs.len() {
                return logged_err!(
                    "leader {} outside of {} replicas",
                    leader,
                    addrs.len()
                );
            }
            pf_info!("the leader is replica {}", leader);
            leader
        } else {
            0
        };

        let completion = if config.check {
            Some(Arc::new(CompletionMap::new(
                config.rounds * config.slots_per_round(),
            )))
        } else {
            None
        };

        Ok(RoundController {
            dispatcher: Dispatcher::new(config.params.flush_interval),
            active: vec![true; addrs.len()],
            config,
            master,
            pool,
            workload,
            leader,
            completion,
            next_cmd: 0,
            metrics: BenchMetrics::new(),
            phase: RoundPhase::Idle,
        })
    }

    #[inline]
    pub fn leader(&self) -> ReplicaIdx {
        self.leader
    }

    #[inline]
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    #[inline]
    pub fn metrics(&self) -> &BenchMetrics {
        &self.metrics
    }

    #[inline]
    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    #[inline]
    pub fn completion(&self) -> Option<&CompletionMap> {
        self.completion.as_deref()
    }

    /// Indices of replicas still in use for leaderless routing.
    pub fn active_replicas(&self) -> Vec<ReplicaIdx> {
        self.active
            .iter()
            .enumerate()
            .filter_map(|(idx, &on)| if on { Some(idx) } else { None })
            .collect()
    }

    #[inline]
    fn set_phase(&mut self, phase: RoundPhase) {
        pf_debug!("phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Maps a pre-drawn replica hint onto the active replicas.
    #[inline]
    fn route_hint(active: &[bool], active_list: &[ReplicaIdx], hint: ReplicaIdx) -> ReplicaIdx {
        if active[hint] {
            hint
        } else {
            active_list[hint % active_list.len()]
        }
    }

    /// Collector sources of the coming round with their expected counts.
    fn round_sources(&self, active_list: &[ReplicaIdx]) -> Vec<(ReplicaIdx, usize)> {
        match self.config.mode {
            RoutingMode::SingleLeader | RoutingMode::FastBroadcast => {
                vec![(self.leader, self.workload.per_round())]
            }
            RoutingMode::LeaderlessRandom => {
                let counts =
                    self.workload.expected_counts(self.active.len(), |hint| {
                        Self::route_hint(&self.active, active_list, hint)
                    });
                active_list.iter().map(|&idx| (idx, counts[idx])).collect()
            }
        }
    }

    /// Composes the round's requests along with their targets.
    fn round_requests(
        &self,
        round: usize,
        active_list: &[ReplicaIdx],
    ) -> Vec<(Request, Target)> {
        (0..self.workload.len())
            .map(|slot| {
                let req = Request {
                    id: self.next_cmd + slot as CommandId,
                    op: self.workload.op(slot),
                    key: self.workload.key(slot),
                    value: slot as i64,
                    round,
                };
                let target = match self.config.mode {
                    RoutingMode::SingleLeader => Target::One(self.leader),
                    RoutingMode::FastBroadcast => Target::All,
                    RoutingMode::LeaderlessRandom => Target::One(Self::route_hint(
                        &self.active,
                        active_list,
                        self.workload.hint(slot),
                    )),
                };
                (req, target)
            })
            .collect()
    }

    /// Starts one collector task per source. Every collector is running
    /// before this returns, so no reply can precede its listener.
    fn start_collectors(
        &mut self,
        sources: &[(ReplicaIdx, usize)],
    ) -> mpsc::Receiver<CollectorReport> {
        let (tx_done, rx_done) = mpsc::channel(sources.len().max(1));
        let idle_timeout = match self.config.params.reply_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        for &(source, quota) in sources {
            let collector = ReplyCollector::new(
                source,
                quota,
                self.next_cmd,
                self.pool.lend_recv(source),
                self.completion.clone(),
                idle_timeout,
            );
            tokio::spawn(collector.run(tx_done.clone()));
        }
        rx_done
    }

    /// Blocks until one report per started collector has arrived, giving
    /// lent stubs back to the pool.
    async fn await_reports(
        &mut self,
        state: &mut RoundState,
        mut rx_done: mpsc::Receiver<CollectorReport>,
    ) {
        let mut reported = vec![false; state.sources.len()];
        for _ in 0..state.sources.len() {
            let Some(report) = rx_done.recv().await else {
                pf_error!("completion channel closed before all collectors reported");
                break;
            };
            if let Some(stub) = report.stub {
                self.pool.give_back_recv(stub);
            }
            if let Some(pos) = state
                .sources
                .iter()
                .position(|&(src, _)| src == report.source)
            {
                reported[pos] = true;
                state.successes[pos] = report.successes;
            }
            self.metrics.add_successes(report.successes);
            if report.errored {
                state.errored.push(report.source);
            }
        }

        // collectors that vanished without reporting count as errored
        for (pos, &(src, _)) in state.sources.iter().enumerate() {
            if !reported[pos] && !state.errored.contains(&src) {
                state.errored.push(src);
            }
        }
    }

    /// Applies failover policy for the errored sources. Returns false if no
    /// replica is left to route to.
    async fn failover(&mut self, errored: &[ReplicaIdx]) -> bool {
        if self.config.mode.uses_leader() {
            match self.master.get_leader().await {
                Ok(leader) if leader < self.active.len() => {
                    if leader != self.leader {
                        pf_warn!("new leader is replica {}", leader);
                    } else {
                        pf_info!("leader remains replica {}", leader);
                    }
                    self.leader = leader;
                }
                Ok(leader) => {
                    pf_error!("master reported invalid leader {}", leader);
                }
                Err(e) => {
                    pf_error!("error refreshing leader: {}", e);
                }
            }
            true
        } else {
            for &src in errored {
                if self.active[src] {
                    pf_warn!("excluding replica {} from future rounds", src);
                    self.active[src] = false;
                }
            }
            if self.active.iter().any(|&on| on) {
                true
            } else {
                pf_error!("every replica has been excluded");
                false
            }
        }
    }

    /// Logs command IDs of the round that never got a reply.
    fn verify_round(&self, state: &RoundState) {
        let Some(map) = self.completion.as_ref() else {
            return;
        };
        let window = state.base_id..state.base_id + self.workload.len();
        let unseen = map.unseen_in(window);
        let within_eps = unseen.len() <= self.config.eps;
        for id in &unseen {
            if within_eps {
                pf_debug!("round {} straggler {} not received", state.round, id);
            } else {
                pf_warn!("round {} didn't receive reply {}", state.round, id);
            }
        }
        if !unseen.is_empty() {
            pf_info!(
                "round {} verification: {} unseen of {}",
                state.round,
                unseen.len(),
                self.workload.len()
            );
        }
    }

    /// Runs one round through the phase state machine. Returns false if the
    /// run cannot continue.
    async fn run_round(&mut self, round: usize) -> Result<bool, LoadError> {
        debug_assert_eq!(self.phase, RoundPhase::Idle);
        let base_id = usize::try_from(self.next_cmd).map_err(LoadError::msg)?;
        if let Some(map) = self.completion.as_ref() {
            map.reset_range(base_id..base_id + self.workload.len());
        }

        let active_list = self.active_replicas();
        let sources = self.round_sources(&active_list);
        let mut state = RoundState {
            round,
            base_id,
            successes: vec![0; sources.len()],
            sources,
            errored: vec![],
            elapsed: Duration::ZERO,
        };

        // listeners first, then dispatch
        self.set_phase(RoundPhase::Dispatching);
        let rx_done = self.start_collectors(&state.sources);
        let reqs = self.round_requests(round, &active_list);
        let before = Instant::now();
        let stats: DispatchStats = self
            .dispatcher
            .dispatch(&mut self.pool.send_stubs, reqs)
            .await;
        self.next_cmd += stats.sent as CommandId;
        if stats.dropped > 0 {
            pf_warn!("round {} dropped {} writes", round, stats.dropped);
        }

        self.set_phase(RoundPhase::AwaitingReplies);
        self.await_reports(&mut state, rx_done).await;
        state.elapsed = before.elapsed();

        let mut proceed = true;
        if !state.errored.is_empty() {
            self.set_phase(RoundPhase::Failover);
            let errored = state.errored.clone();
            proceed = self.failover(&errored).await;
        }

        self.set_phase(RoundPhase::Done);
        self.metrics.record_round(state.elapsed);
        pf_info!(
            "round {} took {:?}, tx.num = {}, successes = {:?}",
            round,
            state.elapsed,
            self.workload.per_round(),
            state.successes
        );
        self.verify_round(&state);

        self.set_phase(RoundPhase::Idle);
        Ok(proceed)
    }

    /// Runs every configured round, closes all connections, and returns the
    /// run summary.
    pub async fn run(&mut self) -> Result<BenchSummary, LoadError> {
        self.metrics.start();
        for round in 0..self.config.rounds {
            if !self.run_round(round).await? {
                pf_error!(
                    "stopping early after {} of {} rounds",
                    round + 1,
                    self.config.rounds
                );
                break;
            }
        }
        let total = self.metrics.finish();
        pf_info!("test took {:?}", total);
        self.set_phase(RoundPhase::Done);
        self.pool.close();

        let summary = self.metrics.summarize(
            REQUEST_BODY_LEN,
            self.config.nreq,
            self.config.rounds,
            self.config.per_round(),
        );
        pf_info!(
            "successful: {}, tps: {:.2}, avg delay: {:.2} ms (stdev {:.2} ms)",
            summary.successes,
            summary.tps,
            summary.avg_delay_ms,
            self.metrics.stdev_latency_ms()
        );
        Ok(summary)
    }
}
