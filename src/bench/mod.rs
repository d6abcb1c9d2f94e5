// A benchmark run is a single batch over a fixed set of endpoints. Every
// endpoint gets its own task, but only a bounded number of tasks may be
// probing at once: the scheduler hands out admission slots and a task keeps
// its slot until it has produced exactly one outcome. Probes are slow and
// unreliable, so each task races its probe against a wall-clock deadline and
// converts anything that goes wrong (timeouts, transport errors, panics) into
// a failure outcome for that endpoint alone.

// Successful measurements are folded into a sharded leaderboard that keeps the
// fastest endpoint per group. The fold is a keep-minimum reduction, so the
// order tasks finish in doesn't matter. The board is only read once the
// scheduler's barrier has been passed, at which point it's ranked and
// reported.
mod board;
mod config;
mod error;
mod netprobe;
mod probe;
mod rank;
mod record;
mod scheduler;
mod source;

pub use board::{LeaderEntry, Leaderboard, LeaderboardAggregator, TieBreak};
pub use config::{BenchConfig, LatencyMethod, NetProbeConfig};
pub use error::{Error, ProbeError};
pub use netprobe::NetProbe;
pub use probe::ProbeService;
pub use rank::{RankReporter, RankedList};
pub use record::{EndpointRecord, Measured, Outcome, Probe, UNKNOWN_GROUP};
pub use scheduler::{BoundedScheduler, Progress, RunSummary};
pub use source::{ConfigSource, StaticSource, WireGuardDir};
