use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use ahash::RandomState;
use hashbrown::HashMap;
use tracing::trace;

const DEFAULT_SHARDS: usize = 16;

/// The fastest endpoint seen so far for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderEntry {
    pub group: String,
    pub latency: Duration,
    pub endpoint_id: String,
}

impl fmt::Display for LeaderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {:?} ({})", self.group, self.latency, self.endpoint_id)
    }
}

pub type Leaderboard = HashMap<String, LeaderEntry>;

/// What to do when a candidate exactly matches the current best latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TieBreak {
    /// Keep whichever endpoint got there first.
    #[default]
    FirstWriter,
    /// Keep the endpoint with the lexically smallest id. Unlike
    /// `FirstWriter`, the result doesn't depend on completion order.
    LowestId,
}

impl TieBreak {
    fn replaces(
        self,
        current: &LeaderEntry,
        latency: Duration,
        id: &str,
    ) -> bool {
        match latency.cmp(&current.latency) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => match self {
                TieBreak::FirstWriter => false,
                TieBreak::LowestId => id < current.endpoint_id.as_str(),
            },
        }
    }
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-writer" => Ok(Self::FirstWriter),
            "lowest-id" => Ok(Self::LowestId),
            other => Err(format!(
                "unknown tie-break policy `{other}` \
                 (expected first-writer or lowest-id)"
            )),
        }
    }
}

/// Keeps the best latency per group while many probe tasks report at once.
///
/// Groups are spread over a fixed set of shards, each behind its own mutex,
/// so the read-compare-write for one group is a single critical section while
/// updates to groups in other shards proceed in parallel. Nothing here
/// awaits, so the locks are never held across a suspension point.
pub struct LeaderboardAggregator {
    shards: Box<[Mutex<Leaderboard>]>,
    hasher: RandomState,
    tie_break: TieBreak,
    processed: AtomicUsize,
    failed: AtomicUsize,
}

impl LeaderboardAggregator {
    pub fn new(tie_break: TieBreak) -> Self {
        Self::with_shards(tie_break, DEFAULT_SHARDS)
    }

    pub fn with_shards(tie_break: TieBreak, shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1))
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            hasher: RandomState::new(),
            tie_break,
            processed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    /// Offers a successful measurement for `group`. Returns true if it became
    /// the group's leader.
    pub fn update(
        &self,
        group: &str,
        latency: Duration,
        endpoint_id: &str,
    ) -> bool {
        self.processed.fetch_add(1, Ordering::AcqRel);
        let mut shard = self.shard(group);
        match shard.get_mut(group) {
            Some(current) => {
                if !self.tie_break.replaces(current, latency, endpoint_id) {
                    return false;
                }
                trace!(
                    "{} overtakes {} in {}: {:?} -> {:?}",
                    endpoint_id,
                    current.endpoint_id,
                    group,
                    current.latency,
                    latency
                );
                current.latency = latency;
                current.endpoint_id = endpoint_id.to_owned();
                true
            }
            None => {
                trace!(
                    "{} opens group {} at {:?}",
                    endpoint_id,
                    group,
                    latency
                );
                shard.insert(
                    group.to_owned(),
                    LeaderEntry {
                        group: group.to_owned(),
                        latency,
                        endpoint_id: endpoint_id.to_owned(),
                    },
                );
                true
            }
        }
    }

    /// Counts a record that produced no measurement. It never touches the
    /// board itself.
    pub fn record_failure(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    /// Records seen so far, successful or not.
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Acquire)
    }

    /// Copies the board out of the shards.
    ///
    /// Only final once the scheduler's run has returned; taken earlier it's
    /// just a view of whatever has been reported so far.
    pub fn snapshot(&self) -> Leaderboard {
        let mut board = Leaderboard::new();
        for shard in self.shards.iter() {
            let shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            board.extend(shard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        board
    }

    fn shard(&self, group: &str) -> MutexGuard<'_, Leaderboard> {
        let idx = self.hasher.hash_one(group) as usize % self.shards.len();
        // a poisoned shard still holds a consistent map: every write to it is
        // a single insert or field assignment
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LeaderboardAggregator {
    fn default() -> Self {
        Self::new(TieBreak::default())
    }
}
