//! Run-wide throughput and latency accounting.

use std::fmt;

use tokio::time::{Duration, Instant};

use statistical::standard_deviation;

/// Accumulated statistics of a run. Only this type does arithmetic over
/// accumulated statistics.
#[derive(Debug, Default)]
pub struct BenchMetrics {
    /// Start timestamp of the run.
    start: Option<Instant>,

    /// Total wall-clock time, fixed by `finish()`.
    total: Option<Duration>,

    /// Elapsed time of each completed round.
    round_lats: Vec<Duration>,

    /// Successful replies across all sources and rounds.
    successes: u64,
}

impl BenchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of the run.
    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.total = None;
    }

    /// Records one round's elapsed time.
    pub fn record_round(&mut self, elapsed: Duration) {
        self.round_lats.push(elapsed);
    }

    /// Adds successful replies reported by a collector.
    pub fn add_successes(&mut self, n: u64) {
        self.successes += n;
    }

    /// Marks the end of the run and returns the total elapsed time.
    pub fn finish(&mut self) -> Duration {
        let total = self.start.map_or(Duration::ZERO, |s| s.elapsed());
        self.total = Some(total);
        total
    }

    /// Sets the total elapsed time directly.
    pub fn set_total(&mut self, total: Duration) {
        self.total = Some(total);
    }

    #[inline]
    pub fn successes(&self) -> u64 {
        self.successes
    }

    #[inline]
    pub fn rounds_recorded(&self) -> usize {
        self.round_lats.len()
    }

    #[inline]
    pub fn round_latencies(&self) -> &[Duration] {
        &self.round_lats
    }

    /// Mean of the recorded round latencies in milliseconds, i.e., their sum
    /// divided by their count.
    pub fn mean_latency_ms(&self) -> f64 {
        if self.round_lats.is_empty() {
            return 0.0;
        }
        let sum: Duration = self.round_lats.iter().sum();
        sum.as_secs_f64() / self.round_lats.len() as f64 * 1000.0
    }

    /// Standard deviation of round latencies in milliseconds.
    pub fn stdev_latency_ms(&self) -> f64 {
        if self.round_lats.len() < 2 {
            return 0.0;
        }
        let lats_ms: Vec<f64> = self
            .round_lats
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        standard_deviation(&lats_ms, Some(self.mean_latency_ms()))
    }

    /// Composes the final summary. `tx_num` is the configured total number
    /// of requests that throughput is computed over.
    pub fn summarize(
        &self,
        tx_size: usize,
        tx_num: usize,
        rounds: usize,
        per_round: usize,
    ) -> BenchSummary {
        let spend_s = self.total.unwrap_or_default().as_secs_f64();
        let tps = if spend_s > 0.0 {
            tx_num as f64 / spend_s
        } else {
            0.0
        };
        BenchSummary {
            tx_size,
            tx_num,
            rounds,
            per_round,
            batch_mib: (tx_size * per_round) as f64 / 1024.0 / 1024.0,
            spend_s,
            tps,
            avg_delay_ms: self.mean_latency_ms(),
            successes: self.successes,
        }
    }
}

/// Final statistics of a run.
#[derive(Debug, PartialEq, Clone)]
pub struct BenchSummary {
    pub tx_size: usize,
    pub tx_num: usize,
    pub rounds: usize,
    pub per_round: usize,
    pub batch_mib: f64,
    pub spend_s: f64,
    pub tps: f64,
    pub avg_delay_ms: f64,
    pub successes: u64,
}

impl BenchSummary {
    /// Tab-separated column header of the summary line.
    pub const HEADER: &'static str =
        "tx.size\ttx.num\tbatch\tbatch.tx.num\tbatch.size\tspend\ttps\tavgDelay";
}

// Tab-separated summary line consumed by benchmarking scripts.
impl fmt::Display for BenchSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{:.2}\t{:.2}\t{:.2}\t{:.2}\t",
            self.tx_size,
            self.tx_num,
            self.rounds,
            self.per_round,
            self.batch_mib,
            self.spend_s,
            self.tps,
            self.avg_delay_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_is_exact_average_of_rounds() {
        let mut metrics = BenchMetrics::new();
        metrics.record_round(Duration::from_millis(10));
        metrics.record_round(Duration::from_millis(30));
        metrics.set_total(Duration::from_millis(100));
        assert!((metrics.mean_latency_ms() - 20.0).abs() < 1e-9);
        // not total / rounds
        assert!((metrics.mean_latency_ms() - 50.0).abs() > 1.0);
        assert!((metrics.stdev_latency_ms() - 14.142).abs() < 0.01);
    }

    #[test]
    fn summary_throughput() {
        let mut metrics = BenchMetrics::new();
        metrics.record_round(Duration::from_millis(500));
        metrics.add_successes(60);
        metrics.add_successes(40);
        metrics.set_total(Duration::from_secs(2));
        let summary = metrics.summarize(29, 100, 1, 100);
        assert_eq!(summary.successes, 100);
        assert!((summary.tps - 50.0).abs() < 1e-9);
        assert!((summary.avg_delay_ms - 500.0).abs() < 1e-9);
        assert_eq!(
            summary.to_string(),
            "29\t100\t1\t100\t0.00\t2.00\t50.00\t500.00\t"
        );
        assert_eq!(BenchSummary::HEADER.split('\t').count(), 8);
    }

    #[test]
    fn empty_metrics() {
        let metrics = BenchMetrics::new();
        assert_eq!(metrics.mean_latency_ms(), 0.0);
        assert_eq!(metrics.stdev_latency_ms(), 0.0);
        assert_eq!(metrics.summarize(29, 10, 1, 10).tps, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn finish_measures_wall_clock() {
        let mut metrics = BenchMetrics::new();
        metrics.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(metrics.finish() >= Duration::from_millis(20));
    }
}
