//! Quorumload client side executable.

use std::process::ExitCode;

use clap::Parser;

use tokio::runtime::Builder;

use quorumload::{
    logger_init, pf_error, pf_info, pf_warn, BenchConfig, BenchParams,
    BenchSummary, KeyDist, LoadError, MasterStub, RoundController,
    RoutingMode,
};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Master (coordination service) host; empty means localhost.
    #[arg(long, default_value_t = String::from(""))]
    maddr: String,

    /// Master port.
    #[arg(long, default_value_t = 7087)]
    mport: u16,

    /// Total number of requests.
    #[arg(short, default_value_t = 5000)]
    q: usize,

    /// Percentage of writes.
    #[arg(short, default_value_t = 100)]
    w: u32,

    /// Leaderless (egalitarian) mode: send each request to a random replica.
    #[arg(short, default_value_t = false)]
    e: bool,

    /// Fast-broadcast mode: send each request to every replica.
    #[arg(short, default_value_t = false)]
    f: bool,

    /// Split the requests into this many rounds.
    #[arg(short, default_value_t = 1)]
    r: usize,

    /// Number of tokio worker threads.
    #[arg(short, default_value_t = 2)]
    p: usize,

    /// Check that every request got a reply.
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Extra requests sent per round without waiting for their replies.
    #[arg(long, default_value_t = 0)]
    eps: usize,

    /// Percentage of conflicting requests; negative selects Zipfian keys.
    #[arg(short, default_value_t = -1, allow_negative_numbers = true)]
    c: i32,

    /// Zipfian s parameter.
    #[arg(short, default_value_t = 2.0)]
    s: f64,

    /// Zipfian v parameter.
    #[arg(short, default_value_t = 1.0)]
    v: f64,

    /// Engine parameters TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    params: String,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(config)` on success
    /// or `Err(LoadError)` on any error.
    fn sanitize(&self) -> Result<BenchConfig, LoadError> {
        if self.p == 0 {
            return Err(LoadError::msg(format!(
                "invalid number of threads {}",
                self.p
            )));
        }
        if self.q == 0 {
            return Err(LoadError::msg(format!(
                "invalid number of requests {}",
                self.q
            )));
        }
        if self.r == 0 || self.q < self.r {
            return Err(LoadError::msg(format!(
                "invalid number of rounds {} for {} requests",
                self.r, self.q
            )));
        }
        if self.w > 100 {
            return Err(LoadError::msg(format!(
                "invalid writes percentage {}",
                self.w
            )));
        }
        let dist = KeyDist::from_conflicts(self.c, self.s, self.v)?;

        // parse optional params string if given
        let params_str = self.params.replace('+', "\n");
        let params = BenchParams::from_toml(if params_str.is_empty() {
            None
        } else {
            Some(&params_str[..])
        })?;

        let config = BenchConfig {
            nreq: self.q,
            writes: self.w as u8,
            mode: RoutingMode::from_flags(self.e, self.f),
            rounds: self.r,
            check: self.check,
            eps: self.eps,
            dist,
            params,
        };
        config.validate()?;
        Ok(config)
    }

    /// Master address in 'host:port' form.
    fn master_addr(&self) -> String {
        let host = if self.maddr.is_empty() {
            "localhost"
        } else {
            &self.maddr
        };
        format!("{}:{}", host, self.mport)
    }
}

/// Actual main function of Quorumload client executable.
fn client_main() -> Result<BenchSummary, LoadError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;
    let master_addr = args.master_addr();

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.p)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, discover the cluster, and run all rounds
    runtime.block_on(async move {
        let retries = config.params.connect_retries;
        let master = MasterStub::new_by_connect(&master_addr, retries).await?;
        let mut controller =
            RoundController::new_and_setup(config, master).await?;
        controller.run().await
    })
}

/// Main function of Quorumload client executable.
fn main() -> ExitCode {
    logger_init("client");

    match client_main() {
        Ok(summary) => {
            println!("{}", BenchSummary::HEADER);
            println!("{}", summary);
            pf_info!("{} of {} requests succeeded", summary.successes, summary.tx_num);
            pf_warn!("client_main exitted successfully");
            ExitCode::SUCCESS
        }
        Err(ref e) => {
            pf_error!("client_main exitted: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args() -> CliArgs {
        CliArgs {
            maddr: "".into(),
            mport: 7087,
            q: 5000,
            w: 100,
            e: false,
            f: false,
            r: 1,
            p: 2,
            check: false,
            eps: 0,
            c: -1,
            s: 2.0,
            v: 1.0,
            params: "".into(),
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), LoadError> {
        let config = args().sanitize()?;
        assert_eq!(config.nreq, 5000);
        assert_eq!(config.writes, 100);
        assert_eq!(config.mode, RoutingMode::SingleLeader);
        assert_eq!(config.dist, KeyDist::Zipfian { s: 2.0, v: 1.0 });
        assert_eq!(config.params, BenchParams::default());
        Ok(())
    }

    #[test]
    fn sanitize_modes_and_params() -> Result<(), LoadError> {
        let mut a = args();
        a.e = true;
        a.c = 10;
        a.params = "flush_interval=7+seed=9".into();
        let config = a.sanitize()?;
        assert_eq!(config.mode, RoutingMode::LeaderlessRandom);
        assert_eq!(config.dist, KeyDist::Conflict { conflicts: 10 });
        assert_eq!(config.params.flush_interval, 7);
        assert_eq!(config.params.seed, 9);
        a.f = true;
        assert_eq!(a.sanitize()?.mode, RoutingMode::FastBroadcast);
        Ok(())
    }

    #[test]
    fn sanitize_invalid() {
        let mut a = args();
        a.c = 101;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.w = 101;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.q = 0;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.r = 0;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.q = 3;
        a.r = 4;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.p = 0;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.s = 1.0;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.v = 0.5;
        assert!(a.sanitize().is_err());
        let mut a = args();
        a.params = "bogus=1".into();
        assert!(a.sanitize().is_err());
    }

    #[test]
    fn master_addr_defaults_localhost() {
        let mut a = args();
        assert_eq!(a.master_addr(), "localhost:7087");
        a.maddr = "10.0.0.1".into();
        a.mport = 9000;
        assert_eq!(a.master_addr(), "10.0.0.1:9000");
    }

    #[test]
    fn parse_negative_conflicts() -> Result<(), LoadError> {
        let a = CliArgs::try_parse_from(["quorumload_client", "-c", "-1", "-q", "10"])
            .map_err(LoadError::msg)?;
        assert_eq!(a.c, -1);
        assert_eq!(a.q, 10);
        Ok(())
    }
}
