use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use cb_types::{CbResult, PointId};

/// Ordered `(timestamp, value)` samples for one telemetry point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    samples: Vec<(DateTime<Utc>, f64)>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(mut samples: Vec<(DateTime<Utc>, f64)>) -> Self {
        samples.sort_by_key(|(ts, _)| *ts);
        Self { samples }
    }

    /// Insert keeping timestamp order; a sample at an existing timestamp
    /// replaces the old value.
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        match self.samples.binary_search_by_key(&timestamp, |(ts, _)| *ts) {
            Ok(idx) => self.samples[idx].1 = value,
            Err(idx) => self.samples.insert(idx, (timestamp, value)),
        }
    }

    pub fn samples(&self) -> &[(DateTime<Utc>, f64)] {
        &self.samples
    }

    pub fn latest(&self) -> Option<(DateTime<Utc>, f64)> {
        self.samples.last().copied()
    }

    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> TimeSeries {
        Self {
            samples: self
                .samples
                .iter()
                .filter(|(ts, _)| *ts >= start && *ts <= end)
                .copied()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// What to read from the telemetry store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub points: Vec<PointId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Store-specific tag filters, passed through untouched.
    pub tags: HashMap<String, String>,
}

impl QuerySpec {
    pub fn new(points: Vec<PointId>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            points,
            start,
            end,
            tags: HashMap::new(),
        }
    }

    /// The trailing window `[now - lookback, now]`.
    pub fn trailing(points: Vec<PointId>, lookback: Duration) -> Self {
        let end = Utc::now();
        Self::new(points, end - lookback, end)
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Where and how a command or result is persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSpec {
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub tags: HashMap<String, String>,
}

impl WriteSpec {
    pub fn new(measurement: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            timestamp: Utc::now(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}

/// Free-form metadata attached to a write.
pub type WriteMetadata = HashMap<String, serde_json::Value>;

/// Read side of the time-series store.
///
/// Implementations may return partial results; callers treat empty or partial
/// maps as a skip-and-retry condition.
pub trait TelemetryReader: Send + Sync {
    fn read(&self, client_key: &str, query: &QuerySpec) -> CbResult<HashMap<PointId, TimeSeries>>;

    /// Release connections. Called once during shutdown.
    fn close(&self) {}
}

/// Write side of the time-series store; also used to emit control commands.
pub trait CommandWriter: Send + Sync {
    /// Returns `true` when the store acknowledged the write.
    fn write(
        &self,
        client_key: &str,
        spec: &WriteSpec,
        values: &HashMap<PointId, f64>,
        metadata: &WriteMetadata,
    ) -> bool;

    fn close(&self) {}
}
