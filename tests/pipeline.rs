use std::{fs, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use hashbrown::HashMap;
use tokio::{select, sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;
use wgrank::bench::{
    BenchConfig, BoundedScheduler, ConfigSource, EndpointRecord,
    LeaderboardAggregator, Probe, ProbeError, ProbeService, RankReporter,
    StaticSource, WireGuardDir,
};

/// Answers from a fixed table after a short delay; unknown addresses hang
/// until cancelled.
struct TableProbe {
    table: HashMap<&'static str, (u64, &'static str)>,
}

impl TableProbe {
    fn new(rows: &[(&'static str, u64, &'static str)]) -> Self {
        Self {
            table: rows
                .iter()
                .map(|(addr, ms, group)| (*addr, (*ms, *group)))
                .collect(),
        }
    }
}

impl ProbeService for TableProbe {
    fn probe<'a>(
        &'a self,
        address: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Probe, ProbeError>> {
        async move {
            let Some(&(ms, group)) = self.table.get(address) else {
                cancel.cancelled().await;
                return Err(ProbeError::Cancelled);
            };
            select! {
                _ = cancel.cancelled() => Err(ProbeError::Cancelled),
                _ = sleep(Duration::from_millis(ms)) => Ok(Probe {
                    latency: Duration::from_millis(ms),
                    group: Some(group.to_owned()),
                }),
            }
        }
        .boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn ranks_fastest_endpoint_per_group() {
    let source = StaticSource(vec![
        EndpointRecord::new("a", "addr1:51820"),
        EndpointRecord::new("b", "addr2:51820"),
        EndpointRecord::new("c", "addr3:51820"),
    ]);
    let probe = Arc::new(TableProbe::new(&[
        ("addr1:51820", 50, "groupA"),
        ("addr2:51820", 30, "groupA"),
        ("addr3:51820", 40, "groupB"),
    ]));
    let board = Arc::new(LeaderboardAggregator::default());
    let dir = tempfile::tempdir().unwrap();
    let config = BenchConfig::builder()
        .concurrency(2)
        .report_path(dir.path().join("stats.txt"))
        .build();

    let summary = BoundedScheduler::new(probe, &config)
        .run(source.list().unwrap(), &board)
        .await;
    assert_eq!(summary.processed(), 3);

    let mut console = Vec::new();
    let ranked = RankReporter::new(config.top_k, &config.report_path)
        .render(board.snapshot(), &mut console)
        .unwrap();

    let rows = ranked
        .entries()
        .iter()
        .map(|e| (e.group.as_str(), e.latency, e.endpoint_id.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        rows,
        [
            ("groupA", Duration::from_millis(30), "b"),
            ("groupB", Duration::from_millis(40), "c"),
        ]
    );
    assert_eq!(
        fs::read_to_string(&config.report_path).unwrap(),
        "(groupA) 30ms (b)\n(groupB) 40ms (c)\n"
    );
    let console = String::from_utf8(console).unwrap();
    assert_eq!(console.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn directory_run_reports_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let configs = [
        ("de-1.conf", "[Peer]\nEndpoint = 10.0.0.1:51820\n"),
        ("de-2.conf", "[Peer]\nEndpoint = 10.0.0.2:51820\n"),
        ("jp-1.conf", "[Peer]\nEndpoint = 10.0.0.3:51820\n"),
        // nothing answers for this one; it has to time out
        ("xx-1.conf", "[Peer]\nEndpoint = 10.0.0.4:51820\n"),
    ];
    for (name, text) in configs {
        fs::write(dir.path().join(name), text).unwrap();
    }
    let probe = Arc::new(TableProbe::new(&[
        ("10.0.0.1:51820", 25, "Germany"),
        ("10.0.0.2:51820", 18, "Germany"),
        ("10.0.0.3:51820", 220, "Japan"),
    ]));
    let config = BenchConfig::builder()
        .concurrency(3)
        .probe_timeout(Duration::from_secs(2))
        .build();
    let board = Arc::new(LeaderboardAggregator::default());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let records = WireGuardDir::new(dir.path()).list().unwrap();
    assert_eq!(records.len(), 4);
    let summary = BoundedScheduler::new(probe, &config)
        .with_progress(tx)
        .run(records, &board)
        .await;

    let mut lines = Vec::new();
    while let Some(progress) = rx.recv().await {
        lines.push(progress.outcome.to_string());
    }
    assert_eq!(lines.len(), 4);
    let timed_out = "(xx-1.conf) FAILED: timed out after 2s".to_string();
    assert!(lines.contains(&timed_out));
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.timed_out, 1);

    let snap = board.snapshot();
    assert_eq!(snap["Germany"].endpoint_id, "de-2.conf");
    assert_eq!(snap["Japan"].latency, Duration::from_millis(220));
    assert_eq!(board.processed(), 4);
}
