use std::{fmt, time::Duration};

use super::error::ProbeError;

/// Group that a measurement is filed under when the probe got a latency but
/// couldn't work out where the endpoint is.
pub const UNKNOWN_GROUP: &str = "unknown";

/// One endpoint to benchmark, as read from a config source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    /// Unique name of the record, usually the config file it came from.
    pub id: String,
    /// `host:port` of the endpoint.
    pub address: String,
}

impl EndpointRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// What a probe reports back when it manages to reach an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub latency: Duration,
    /// `None` when the endpoint's group (country) couldn't be determined.
    pub group: Option<String>,
}

/// A successful measurement after the group key has been settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measured {
    pub group: String,
    pub latency: Duration,
}

/// The single terminal outcome of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub id: String,
    pub result: Result<Measured, ProbeError>,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.result {
            Ok(m) => write!(f, "({}) {:?} [{}]", self.id, m.latency, m.group),
            Err(e) => write!(f, "({}) FAILED: {}", self.id, e),
        }
    }
}
