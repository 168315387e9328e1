//! Measurement records and report types shared by the load engine and the
//! coordinator.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of per-request samples retained in a report's arrays.
/// Successes past the cap still update the running sums.
pub const MAX_RECORDED: usize = 1_000_000;

/// Outcome of a single request attempt.
///
/// Produced by a worker's timing probe, handed over the result channel and
/// consumed exactly once by the collector; never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct AttemptRecord {
    /// Wall-clock time from just before send to body fully read.
    pub duration: Duration,
    /// TCP connection establishment.
    pub conn_duration: Duration,
    /// DNS resolution.
    pub dns_duration: Duration,
    /// Connect end (or attempt start on a reused connection) to request
    /// fully written; TLS setup lands here.
    pub req_duration: Duration,
    /// Request written to first response byte.
    pub delay_duration: Duration,
    /// First response byte to body fully read.
    pub res_duration: Duration,
    /// HTTP status, or 0 on transport failure.
    pub status_code: u16,
    /// Response body bytes drained, or -1 if unknown.
    pub content_length: i64,
    /// Time from engine start to attempt start.
    pub offset: Duration,
    /// Transport error, if the attempt failed.
    pub error: Option<String>,
}

impl AttemptRecord {
    /// Record for an attempt that failed before yielding a response.
    /// Phase durations stay zero; only the offset and the error string carry
    /// information.
    pub fn failed(offset: Duration, error: impl ToString) -> Self {
        AttemptRecord {
            offset,
            content_length: -1,
            error: Some(error.to_string()),
            ..AttemptRecord::default()
        }
    }
}

/// Per-server measurement set, as served by `GET /run`.
///
/// Wire format: lowerCamelCase field names, `totalDuration` in integer
/// nanoseconds, every other duration value in floating-point seconds.
/// Unknown fields are ignored on input; missing fields default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerReport {
    /// Wall time between engine start and the last result drained.
    #[serde(with = "duration_nanos")]
    pub total_duration: Duration,
    pub avg_total: f64,
    pub fastest: f64,
    pub slowest: f64,
    pub average: f64,
    /// Successful results per second of `total_duration`.
    pub rps: f64,
    /// Sum of positive response sizes over successful results.
    pub content_length: i64,
    pub avg_conn: f64,
    #[serde(rename = "avgDNS")]
    pub avg_dns: f64,
    pub avg_req: f64,
    pub avg_res: f64,
    pub avg_delay: f64,
    /// Parallel arrays indexed by successful result, seconds.
    pub lats: Vec<f64>,
    pub conn_lats: Vec<f64>,
    pub dns_lats: Vec<f64>,
    pub req_lats: Vec<f64>,
    pub res_lats: Vec<f64>,
    pub delay_lats: Vec<f64>,
    pub offsets: Vec<f64>,
    pub status_codes: Vec<u16>,
    /// Error string to occurrence count.
    pub errors: HashMap<String, u64>,
}

/// Latency at or above which the given fraction of requests fall.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyDistribution {
    pub percentage: u8,
    pub latency: f64,
}

/// One histogram bucket; `mark` is the bucket's upper boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub mark: f64,
    pub count: u64,
    pub frequency: f64,
}

/// Fleet-wide report produced by the coordinator aggregator.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Longest `total_duration` across the fleet.
    pub total: Duration,
    pub avg_total: f64,
    pub fastest: f64,
    pub slowest: f64,
    /// Mean of the per-server rates, not their sum.
    pub rps: f64,

    pub avg_conn: f64,
    pub avg_dns: f64,
    pub avg_req: f64,
    pub avg_res: f64,
    pub avg_delay: f64,
    pub conn_min: f64,
    pub conn_max: f64,
    pub dns_min: f64,
    pub dns_max: f64,
    pub req_min: f64,
    pub req_max: f64,
    pub res_min: f64,
    pub res_max: f64,
    pub delay_min: f64,
    pub delay_max: f64,

    /// Concatenated per-request arrays; latency arrays are sorted ascending
    /// during the merge, offsets keep arrival order.
    pub lats: Vec<f64>,
    pub conn_lats: Vec<f64>,
    pub dns_lats: Vec<f64>,
    pub req_lats: Vec<f64>,
    pub res_lats: Vec<f64>,
    pub delay_lats: Vec<f64>,
    pub offsets: Vec<f64>,
    pub status_codes: Vec<u16>,

    pub size_total: i64,
    /// Successful results plus error occurrences across the fleet.
    pub num_res: u64,
    pub status_code_dist: HashMap<u16, u64>,
    pub error_dist: HashMap<String, u64>,
    pub latency_distribution: Vec<LatencyDistribution>,
    pub histogram: Vec<Bucket>,
}

/// Serialize a `Duration` as integer nanoseconds, the wire encoding used for
/// `totalDuration`.
pub(crate) mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
