use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use cb_types::{CbResult, PointId, TelemetryError};

use crate::telemetry::{CommandWriter, QuerySpec, TelemetryReader, TimeSeries, WriteMetadata, WriteSpec};

/// A write accepted by [`InMemoryTelemetry`].
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub client_key: String,
    pub measurement: String,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<PointId, f64>,
    pub metadata: WriteMetadata,
}

/// Counters for reads and writes served
#[derive(Debug, Clone, Default)]
pub struct TelemetryStats {
    pub reads: u64,
    pub failed_reads: u64,
    pub writes: u64,
    pub failed_writes: u64,
}

/// Process-local telemetry store implementing both the reader and the writer.
///
/// Writes are folded back into the stored series so commanded setpoints show
/// up on the next read. Failures can be injected for the retry paths.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    series: DashMap<PointId, RwLock<TimeSeries>>,
    writes: Mutex<Vec<WriteRecord>>,
    stats: RwLock<TelemetryStats>,
    pending_read_failures: AtomicUsize,
    fail_writes: AtomicBool,
    write_latency: Mutex<Duration>,
    closed: AtomicBool,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, point: &str, timestamp: DateTime<Utc>, value: f64) {
        self.series
            .entry(point.to_string())
            .or_default()
            .write()
            .push(timestamp, value);
    }

    pub fn insert_series(&self, point: &str, series: TimeSeries) {
        self.series.insert(point.to_string(), RwLock::new(series));
    }

    /// Make the next `count` reads fail with a transient error.
    pub fn fail_next_reads(&self, count: usize) {
        self.pending_read_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulated store round-trip applied to every write.
    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock() = latency;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn stats(&self) -> TelemetryStats {
        self.stats.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn take_read_failure(&self) -> bool {
        self.pending_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TelemetryReader for InMemoryTelemetry {
    fn read(&self, client_key: &str, query: &QuerySpec) -> CbResult<HashMap<PointId, TimeSeries>> {
        if self.is_closed() {
            return Err(TelemetryError::Closed {
                client: client_key.to_string(),
            }
            .into());
        }
        if self.take_read_failure() {
            self.stats.write().failed_reads += 1;
            return Err(TelemetryError::ReadFailed {
                client: client_key.to_string(),
                message: "injected read failure".to_string(),
            }
            .into());
        }

        let mut result = HashMap::with_capacity(query.points.len());
        for point in &query.points {
            if let Some(entry) = self.series.get(point) {
                let window = entry.read().window(query.start, query.end);
                if !window.is_empty() {
                    result.insert(point.clone(), window);
                }
            }
        }

        self.stats.write().reads += 1;
        debug!(
            client = client_key,
            requested = query.points.len(),
            returned = result.len(),
            "telemetry read"
        );
        Ok(result)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl CommandWriter for InMemoryTelemetry {
    fn write(
        &self,
        client_key: &str,
        spec: &WriteSpec,
        values: &HashMap<PointId, f64>,
        metadata: &WriteMetadata,
    ) -> bool {
        let latency = *self.write_latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        if self.is_closed() || self.fail_writes.load(Ordering::SeqCst) {
            self.stats.write().failed_writes += 1;
            return false;
        }

        for (point, value) in values {
            self.insert(point, spec.timestamp, *value);
        }
        self.writes.lock().push(WriteRecord {
            client_key: client_key.to_string(),
            measurement: spec.measurement.clone(),
            timestamp: spec.timestamp,
            values: values.clone(),
            metadata: metadata.clone(),
        });
        self.stats.write().writes += 1;
        true
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_read_returns_partial_results() {
        let store = InMemoryTelemetry::new();
        let now = Utc::now();
        store.insert("kw", now - ChronoDuration::minutes(1), 90.0);

        let query = QuerySpec::trailing(
            vec!["kw".to_string(), "absent".to_string()],
            ChronoDuration::minutes(5),
        );
        let result = store.read("current", &query).unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("kw"));
    }

    #[test]
    fn test_injected_read_failures_are_consumed() {
        let store = InMemoryTelemetry::new();
        store.fail_next_reads(2);
        let query = QuerySpec::trailing(vec!["kw".to_string()], ChronoDuration::minutes(5));

        assert!(store.read("history", &query).is_err());
        assert!(store.read("history", &query).is_err());
        assert!(store.read("history", &query).is_ok());
        assert_eq!(store.stats().failed_reads, 2);
    }

    #[test]
    fn test_write_is_recorded_and_readable() {
        let store = InMemoryTelemetry::new();
        let spec = WriteSpec::new("control").with_tag("device", "crac-01");
        let values: HashMap<PointId, f64> = [("sp_t".to_string(), 23.0)].into_iter().collect();

        assert!(store.write("control", &spec, &values, &WriteMetadata::new()));
        assert_eq!(store.writes().len(), 1);

        let query = QuerySpec::trailing(vec!["sp_t".to_string()], ChronoDuration::minutes(1));
        let result = store.read("current", &query).unwrap();
        assert_eq!(result["sp_t"].latest().map(|(_, v)| v), Some(23.0));
    }

    #[test]
    fn test_failed_and_closed_writes() {
        let store = InMemoryTelemetry::new();
        let spec = WriteSpec::new("control");
        let values = HashMap::new();

        store.set_fail_writes(true);
        assert!(!store.write("control", &spec, &values, &WriteMetadata::new()));
        store.set_fail_writes(false);

        CommandWriter::close(&store);
        assert!(!store.write("control", &spec, &values, &WriteMetadata::new()));
        let query = QuerySpec::trailing(vec!["sp_t".to_string()], ChronoDuration::minutes(1));
        assert!(store.read("current", &query).is_err());
        assert_eq!(store.stats().failed_writes, 2);
    }
}
