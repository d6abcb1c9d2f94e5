use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use wgrank::bench::{
    BenchConfig, BoundedScheduler, ConfigSource, Error, LatencyMethod,
    LeaderboardAggregator, NetProbe, NetProbeConfig, Progress, RankReporter,
    RankedList, TieBreak, WireGuardDir,
};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Find the lowest-latency WireGuard endpoint per country"
)]
struct Cli {
    /// Directory of WireGuard configs, one endpoint per file
    #[arg(long, env = "WGRANK_CONFIG_DIR", default_value = "./config")]
    config_dir: PathBuf,
    /// Probes in flight at once [default: available parallelism]
    #[arg(long, env = "WGRANK_CONCURRENCY")]
    concurrency: Option<usize>,
    /// Per-endpoint deadline in milliseconds
    #[arg(long, env = "WGRANK_TIMEOUT_MS", default_value_t = 10_000)]
    timeout_ms: u64,
    /// How many leaders to print
    #[arg(long, env = "WGRANK_TOP", default_value_t = 10)]
    top: usize,
    /// Where to write the full ranking
    #[arg(long, env = "WGRANK_REPORT", default_value = "stats.txt")]
    report: PathBuf,
    /// How round trips are timed (icmp or tcp)
    #[arg(long, env = "WGRANK_METHOD", default_value = "icmp")]
    method: LatencyMethod,
    /// Round trips averaged per endpoint
    #[arg(long, env = "WGRANK_SAMPLES", default_value_t = 3)]
    samples: usize,
    /// With --method tcp, time handshakes against this port instead of the
    /// endpoint's own
    #[arg(long, env = "WGRANK_PROBE_PORT")]
    probe_port: Option<u16>,
    /// Which endpoint keeps a group on an exact latency tie
    /// (first-writer or lowest-id)
    #[arg(long, env = "WGRANK_TIE_BREAK", default_value = "first-writer")]
    tie_break: TieBreak,
}

impl Cli {
    fn bench_config(&self) -> BenchConfig {
        let config = BenchConfig::builder()
            .probe_timeout(Duration::from_millis(self.timeout_ms))
            .top_k(self.top)
            .tie_break(self.tie_break)
            .report_path(self.report.clone());
        match self.concurrency {
            Some(c) => config.concurrency(c).build(),
            None => config.build(),
        }
    }

    fn probe_config(&self) -> NetProbeConfig {
        let config = NetProbeConfig::builder()
            .method(self.method)
            .samples(self.samples);
        match self.probe_port {
            Some(port) => config.probe_port(port).build(),
            None => config.build(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wgrank: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = cli.bench_config();
    let records = WireGuardDir::new(&cli.config_dir).list()?;
    let probe = Arc::new(NetProbe::new(cli.probe_config())?);
    let board = Arc::new(LeaderboardAggregator::new(config.tie_break));

    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(progress_rx));
    let scheduler =
        BoundedScheduler::new(probe, &config).with_progress(progress_tx);

    let shutdown = scheduler.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling outstanding probes");
            shutdown.cancel();
        }
    });

    let summary = scheduler.run(records, &board).await;
    // the printer drains until every sender is gone
    drop(scheduler);
    if let Err(e) = printer.await {
        warn!("progress printer stopped early: {}", e);
    }

    let ranked = RankedList::from_board(board.snapshot());
    let reporter = RankReporter::new(config.top_k, &config.report_path)
        .with_group_label("country");
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "\n").map_err(Error::Console)?;
    reporter.publish(&ranked, &mut stdout)?;
    writeln!(
        stdout,
        "\n{} of {} endpoints answered ({} timed out) in {:.1}s; \
         ranking written to {}",
        summary.succeeded,
        summary.total,
        summary.timed_out,
        (summary.finished_at - summary.started_at).num_milliseconds() as f64
            / 1000.0,
        config.report_path.display()
    )
    .map_err(Error::Console)?;
    Ok(())
}

/// One line per resolved endpoint, in the order they resolve.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<Progress>) {
    while let Some(Progress {
        seq,
        total,
        outcome,
    }) = rx.recv().await
    {
        println!("{seq}/{total}. {outcome}");
    }
}
