use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use hashbrown::HashMap;
use tokio::{
    select,
    sync::{mpsc, Semaphore},
    task::JoinSet,
    time::{sleep_until, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    board::LeaderboardAggregator,
    config::BenchConfig,
    error::ProbeError,
    probe::ProbeService,
    record::{EndpointRecord, Measured, Outcome, Probe, UNKNOWN_GROUP},
};

/// Emitted once per record, in the order records resolve.
#[derive(Debug, Clone)]
pub struct Progress {
    /// 1-based position in resolution order.
    pub seq: usize,
    pub total: usize,
    pub outcome: Outcome,
}

/// Totals for a finished run. `succeeded + failed == total` whenever
/// [`BoundedScheduler::run`] has returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Includes timeouts.
    pub failed: usize,
    pub timed_out: usize,
    /// Most probes that were ever in flight at once.
    pub peak_in_flight: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn processed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Runs one probe task per record with at most `slots` of them in flight.
///
/// A record is admitted once a slot is free; from then on its probe races a
/// deadline of `probe_timeout`. When the deadline wins the probe's token is
/// cancelled, it gets `cancel_grace` to wind down and is then dropped, and
/// the record is reported as timed out. Slots are owned permits held by the
/// task, so they come back on every exit path including panics.
pub struct BoundedScheduler<P> {
    probe: Arc<P>,
    slots: usize,
    probe_timeout: Duration,
    cancel_grace: Duration,
    shutdown: CancellationToken,
    progress: Option<mpsc::UnboundedSender<Progress>>,
}

impl<P: ProbeService> BoundedScheduler<P> {
    pub fn new(probe: Arc<P>, config: &BenchConfig) -> Self {
        Self {
            probe,
            slots: config.slots(),
            probe_timeout: config.probe_timeout,
            cancel_grace: config.cancel_grace,
            shutdown: CancellationToken::new(),
            progress: None,
        }
    }

    /// Streams a [`Progress`] event for every record as it resolves.
    pub fn with_progress(
        mut self,
        tx: mpsc::UnboundedSender<Progress>,
    ) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Cancelling this token cancels every in-flight probe. Records that
    /// haven't started yet resolve immediately as cancelled, so a run still
    /// returns with one outcome per record.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Probes every record and folds the results into `board`.
    ///
    /// Returns only after every record has produced exactly one outcome and
    /// every task has finished, so `board` is final once this resolves.
    pub async fn run(
        &self,
        records: Vec<EndpointRecord>,
        board: &Arc<LeaderboardAggregator>,
    ) -> RunSummary {
        let total = records.len();
        let started_at = Utc::now();
        let span = debug_span!("run", total, slots = self.slots);
        async move {
            let slots = Arc::new(Semaphore::new(self.slots));
            let ctx = Arc::new(TaskContext {
                probe: self.probe.clone(),
                board: board.clone(),
                progress: self.progress.clone(),
                probe_timeout: self.probe_timeout,
                cancel_grace: self.cancel_grace,
                total,
                seq: AtomicUsize::new(0),
                in_flight: InFlight::default(),
            });
            let mut tally = Tally::default();
            let mut tasks = JoinSet::new();
            let mut ids = HashMap::with_capacity(total);

            for record in records {
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        // only happens if the pool is closed, which it never
                        // is while we're dispatching
                        let outcome =
                            ctx.settle(record.id, Err(ProbeError::Cancelled));
                        tally.add(&outcome);
                        continue;
                    }
                };
                let token = self.shutdown.child_token();
                let task_ctx = ctx.clone();
                let id = record.id.clone();
                let handle = tasks.spawn(async move {
                    let _permit = permit;
                    task_ctx.execute(record, token).await
                });
                ids.insert(handle.id(), id);
            }
            debug!("all records dispatched, waiting for stragglers");

            while let Some(joined) = tasks.join_next_with_id().await {
                match joined {
                    Ok((task, outcome)) => {
                        ids.remove(&task);
                        tally.add(&outcome);
                    }
                    Err(e) => {
                        // the task died before settling; settle for it so the
                        // record still gets its one outcome
                        let Some(id) = ids.remove(&e.id()) else {
                            warn!("unknown probe task ended: {}", e);
                            continue;
                        };
                        warn!("probe task for {} ended abnormally: {}", id, e);
                        let reason = if e.is_panic() {
                            ProbeError::Panicked(e.to_string())
                        } else {
                            ProbeError::Cancelled
                        };
                        tally.add(&ctx.settle(id, Err(reason)));
                    }
                }
            }

            let summary = RunSummary {
                total,
                succeeded: tally.succeeded,
                failed: tally.failed,
                timed_out: tally.timed_out,
                peak_in_flight: ctx.in_flight.peak(),
                started_at,
                finished_at: Utc::now(),
            };
            debug!(
                "run finished: {} ok, {} failed ({} timed out), \
                 peak {} in flight",
                summary.succeeded,
                summary.failed,
                summary.timed_out,
                summary.peak_in_flight
            );
            summary
        }
        .instrument(span)
        .await
    }
}

/// Everything a probe task needs, shared by all tasks of one run.
struct TaskContext<P> {
    probe: Arc<P>,
    board: Arc<LeaderboardAggregator>,
    progress: Option<mpsc::UnboundedSender<Progress>>,
    probe_timeout: Duration,
    cancel_grace: Duration,
    total: usize,
    seq: AtomicUsize,
    in_flight: InFlight,
}

impl<P: ProbeService> TaskContext<P> {
    async fn execute(
        &self,
        record: EndpointRecord,
        cancel: CancellationToken,
    ) -> Outcome {
        let span =
            debug_span!("probe", id = %record.id, addr = %record.address);
        let _in_flight = self.in_flight.enter();
        // `measure` drops the probe future before returning, so a panic in
        // its destructor is caught here too
        let result = AssertUnwindSafe(
            self.measure(&record.address, cancel).instrument(span.clone()),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(ProbeError::Panicked(panic_message(&*panic)))
        });
        span.in_scope(|| self.settle(record.id, result))
    }

    /// Races the probe against this task's deadline.
    async fn measure(
        &self,
        address: &str,
        cancel: CancellationToken,
    ) -> Result<Probe, ProbeError> {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let deadline = Instant::now() + self.probe_timeout;
        let mut probe = self.probe.probe(address, cancel.clone());

        select! {
            res = &mut probe => res,
            _ = sleep_until(deadline) => {
                cancel.cancel();
                if timeout(self.cancel_grace, &mut probe).await.is_err() {
                    debug!(
                        "probe ignored cancellation for {:?}, dropping it",
                        self.cancel_grace
                    );
                }
                Err(ProbeError::Timeout(self.probe_timeout))
            }
        }
    }

    /// Files the record's single outcome: board, counters, progress.
    fn settle(
        &self,
        id: String,
        result: Result<Probe, ProbeError>,
    ) -> Outcome {
        let result = match result {
            Ok(Probe { latency, group }) => {
                let group = group.unwrap_or_else(|| {
                    warn!(
                        "no group key for {}, filing it under {}",
                        id, UNKNOWN_GROUP
                    );
                    UNKNOWN_GROUP.to_owned()
                });
                self.board.update(&group, latency, &id);
                debug!("{} measured {:?} in {}", id, latency, group);
                Ok(Measured { group, latency })
            }
            Err(e) => {
                warn!("probe of {} failed: {}", id, e);
                self.board.record_failure();
                Err(e)
            }
        };

        let outcome = Outcome { id, result };
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(progress) = &self.progress {
            // a dropped receiver just means nobody is watching
            let _ = progress.send(Progress {
                seq,
                total: self.total,
                outcome: outcome.clone(),
            });
        }
        outcome
    }
}

#[derive(Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    timed_out: usize,
}

impl Tally {
    fn add(&mut self, outcome: &Outcome) {
        match &outcome.result {
            Ok(_) => self.succeeded += 1,
            Err(e) => {
                self.failed += 1;
                if e.is_timeout() {
                    self.timed_out += 1;
                }
            }
        }
    }
}

/// Gauge of probes currently running, with a high-water mark.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        InFlightGuard(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
