use std::{
    fmt, num::NonZeroUsize, path::PathBuf, str::FromStr, thread,
    time::Duration,
};

use typed_builder::TypedBuilder;

use super::board::TieBreak;

/// Where the original listing went, relative to the working directory.
pub const DEFAULT_REPORT_PATH: &str = "stats.txt";

/// Settings for one benchmark run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct BenchConfig {
    /// Maximum number of probes in flight. Zero is treated as one.
    #[builder(default = default_concurrency())]
    pub concurrency: usize,
    /// Hard wall-clock budget for a single probe, measured from the moment
    /// its task is admitted.
    #[builder(default = Duration::from_secs(10))]
    pub probe_timeout: Duration,
    /// How long a timed-out probe gets to notice its cancellation before its
    /// future is dropped.
    #[builder(default = Duration::from_millis(250))]
    pub cancel_grace: Duration,
    /// How many leaders the console summary shows.
    #[builder(default = 10)]
    pub top_k: usize,
    #[builder(default)]
    pub tie_break: TieBreak,
    #[builder(default = PathBuf::from(DEFAULT_REPORT_PATH), setter(into))]
    pub report_path: PathBuf,
}

impl BenchConfig {
    /// The concurrency actually used: never zero.
    pub fn slots(&self) -> usize {
        self.concurrency.max(1)
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Number of parallel execution units, or one if that can't be determined.
pub fn default_concurrency() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// How a round trip to an endpoint is timed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMethod {
    /// ICMP echo over an unprivileged datagram socket.
    #[default]
    Icmp,
    /// TCP handshake against the endpoint's port (or `probe_port`). A
    /// refused connection still counts as an answer.
    Tcp,
}

impl fmt::Display for LatencyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Icmp => f.write_str("icmp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

impl FromStr for LatencyMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" | "ping" => Ok(Self::Icmp),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!(
                "unknown latency method `{other}` (expected icmp or tcp)"
            )),
        }
    }
}

/// Settings for [`NetProbe`](super::NetProbe).
#[derive(Debug, Clone, TypedBuilder)]
pub struct NetProbeConfig {
    #[builder(default)]
    pub method: LatencyMethod,
    /// Round trips averaged into one latency figure.
    #[builder(default = 3)]
    pub samples: usize,
    /// Pause between samples to the same endpoint.
    #[builder(default = Duration::from_millis(10))]
    pub sample_interval: Duration,
    /// Budget for a single echo or handshake.
    #[builder(default = Duration::from_secs(2))]
    pub sample_timeout: Duration,
    /// Geolocation lookup URL; `{ip}` is replaced with the endpoint's IP.
    #[builder(
        default = String::from("https://ipapi.co/{ip}/json/"),
        setter(into)
    )]
    pub geo_url: String,
    #[builder(default = Duration::from_secs(5))]
    pub geo_timeout: Duration,
    #[builder(
        default = String::from(concat!("wgrank/", env!("CARGO_PKG_VERSION"))),
        setter(into)
    )]
    pub user_agent: String,
    /// Port to time handshakes against instead of the endpoint's own. Only
    /// used by [`LatencyMethod::Tcp`].
    #[builder(default, setter(strip_option))]
    pub probe_port: Option<u16>,
}

impl Default for NetProbeConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
