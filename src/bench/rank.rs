use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use super::{
    board::{LeaderEntry, Leaderboard},
    error::Error,
};

/// Leaders ordered fastest first. Built once, after the run, and never
/// modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedList {
    entries: Vec<LeaderEntry>,
}

impl RankedList {
    /// Sorts by latency, breaking ties on the group name so the order never
    /// depends on hash iteration order.
    pub fn from_board(board: Leaderboard) -> Self {
        let mut entries = board.into_values().collect::<Vec<_>>();
        entries.sort_by(|a, b| {
            a.latency
                .cmp(&b.latency)
                .then_with(|| a.group.cmp(&b.group))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[LeaderEntry] {
        &self.entries
    }

    /// The first `k` leaders, or all of them if there are fewer.
    pub fn top(&self, k: usize) -> &[LeaderEntry] {
        &self.entries[..k.min(self.entries.len())]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes one `(<group>) <latency> (<endpoint id>)` line per leader.
    pub fn write_listing<W: Write>(&self, mut w: W) -> io::Result<()> {
        for entry in &self.entries {
            writeln!(w, "{}", entry)?;
        }
        w.flush()
    }

    /// Writes the full listing to `path`, replacing whatever was there.
    pub fn persist(&self, path: &Path) -> Result<(), Error> {
        let file = File::create(path).map_err(Error::ReportWrite)?;
        self.write_listing(BufWriter::new(file))
            .map_err(Error::ReportWrite)?;
        debug!("wrote {} leaders to {}", self.len(), path.display());
        Ok(())
    }

    /// Prints the top `k` leaders as an aligned table. `label` names what
    /// the group key stands for in the heading.
    pub fn render_top<W: Write>(
        &self,
        k: usize,
        label: &str,
        mut w: W,
    ) -> io::Result<()> {
        if self.is_empty() {
            writeln!(w, "No reachable endpoints.")?;
            return w.flush();
        }
        let top = self.top(k);
        writeln!(w, "Top {} fastest endpoints by {}:", top.len(), label)?;
        for entry in top {
            // Duration's Debug output ignores width, so pad it ourselves
            let latency = format!("{:?}", entry.latency);
            writeln!(
                w,
                "({:<10}) {:<15} ({})",
                entry.group, latency, entry.endpoint_id
            )?;
        }
        w.flush()
    }
}

/// Turns the final board into the persisted listing and the console summary.
pub struct RankReporter {
    top_k: usize,
    report_path: PathBuf,
    group_label: String,
}

impl RankReporter {
    pub fn new(top_k: usize, report_path: impl Into<PathBuf>) -> Self {
        Self {
            top_k,
            report_path: report_path.into(),
            group_label: String::from("group"),
        }
    }

    /// What the console heading calls a group, e.g. `"country"`.
    pub fn with_group_label(mut self, label: impl Into<String>) -> Self {
        self.group_label = label.into();
        self
    }

    /// Ranks `board` and publishes the result.
    pub fn render<W: Write>(
        &self,
        board: Leaderboard,
        console: W,
    ) -> Result<RankedList, Error> {
        let ranked = RankedList::from_board(board);
        self.publish(&ranked, console)?;
        Ok(ranked)
    }

    /// Prints the top slice to `console`, then persists the full listing.
    /// Both only read `ranked`, so it's still intact if either write fails.
    pub fn publish<W: Write>(
        &self,
        ranked: &RankedList,
        console: W,
    ) -> Result<(), Error> {
        ranked
            .render_top(self.top_k, &self.group_label, console)
            .map_err(Error::Console)?;
        ranked.persist(&self.report_path)
    }
}
