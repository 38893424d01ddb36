//! Ingest gateway: raw update events in, registry upserts out.
//!
//! Sources post a batch keyed by sensor name, each entry carrying
//! `{sensorId, value, timestamp}`. Entries are validated independently;
//! a malformed entry is rejected with a reason and never reaches the
//! registry, while the rest of the batch still lands.

use crate::registry::{Sensor, SensorKind, SensorRegistry};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Ingest validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    Malformed(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Malformed(reason) => write!(f, "malformed reading: {reason}"),
        }
    }
}

impl std::error::Error for IngestError {}

/// One rejected batch entry.
#[derive(Debug, Clone, Serialize)]
pub struct RejectedReading {
    pub name: String,
    pub reason: String,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: Vec<RejectedReading>,
}

/// Running ingest counters, surfaced via the health endpoint.
#[derive(Debug, Default)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    last_event_ms: AtomicI64,
}

impl IngestStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Milliseconds timestamp of the last accepted reading, 0 if none yet.
    pub fn last_event_ms(&self) -> i64 {
        self.last_event_ms.load(Ordering::Relaxed)
    }

    fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.last_event_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}

/// Normalizes raw update events into registry writes.
pub struct IngestGateway {
    registry: Arc<SensorRegistry>,
    stats: IngestStats,
}

impl IngestGateway {
    pub fn new(registry: Arc<SensorRegistry>) -> Self {
        Self {
            registry,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Apply one validated reading.
    ///
    /// A missing timestamp is filled with the server clock; last-writer-wins
    /// ordering then applies against whatever the registry holds.
    pub fn ingest(
        &self,
        sensor_id: &str,
        kind: SensorKind,
        value: f64,
        timestamp: Option<i64>,
    ) -> Result<Sensor, IngestError> {
        if sensor_id.is_empty() {
            self.stats.record_rejected();
            return Err(IngestError::Malformed("empty sensorId".to_string()));
        }
        if !value.is_finite() {
            self.stats.record_rejected();
            return Err(IngestError::Malformed(format!(
                "non-finite value for {sensor_id}"
            )));
        }

        let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp_millis());
        let sensor = self.registry.upsert(sensor_id, kind, value, timestamp);
        self.stats.record_accepted();
        Ok(sensor)
    }

    /// Apply a raw batch: a JSON object keyed by sensor name, each value an
    /// object with `sensorId`, numeric `value`, and optional integer
    /// `timestamp`. Returns the per-entry outcome; rejected entries are
    /// logged and dropped.
    pub fn ingest_batch(&self, batch: &serde_json::Map<String, Value>) -> IngestReport {
        let mut accepted = 0;
        let mut rejected = Vec::new();

        for (name, entry) in batch {
            match parse_entry(name, entry) {
                Ok((sensor_id, value, timestamp)) => {
                    match self.ingest(&sensor_id, SensorKind::parse(name), value, timestamp) {
                        Ok(_) => accepted += 1,
                        Err(IngestError::Malformed(reason)) => {
                            tracing::warn!(%name, %reason, "rejected reading");
                            rejected.push(RejectedReading {
                                name: name.clone(),
                                reason,
                            });
                        }
                    }
                }
                Err(reason) => {
                    tracing::warn!(%name, %reason, "rejected reading");
                    self.stats.record_rejected();
                    rejected.push(RejectedReading {
                        name: name.clone(),
                        reason,
                    });
                }
            }
        }

        IngestReport { accepted, rejected }
    }
}

/// Shape-check one batch entry. Returns (sensor_id, value, timestamp).
fn parse_entry(name: &str, entry: &Value) -> Result<(String, f64, Option<i64>), String> {
    if name.is_empty() {
        return Err("empty sensor name".to_string());
    }
    let obj = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;

    let sensor_id = obj
        .get("sensorId")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing sensorId".to_string())?;
    if sensor_id.is_empty() {
        return Err("empty sensorId".to_string());
    }

    let value = obj
        .get("value")
        .and_then(Value::as_f64)
        .ok_or_else(|| "value is not numeric".to_string())?;

    let timestamp = match obj.get("timestamp") {
        None | Some(Value::Null) => None,
        Some(ts) => Some(
            ts.as_i64()
                .ok_or_else(|| "timestamp is not an integer".to_string())?,
        ),
    };

    Ok((sensor_id.to_string(), value, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> (Arc<SensorRegistry>, IngestGateway) {
        let registry = Arc::new(SensorRegistry::new(64));
        let gateway = IngestGateway::new(Arc::clone(&registry));
        (registry, gateway)
    }

    #[test]
    fn test_ingest_valid_reading() {
        let (registry, gateway) = gateway();
        gateway
            .ingest("hr-1", SensorKind::HeartRate, 72.0, Some(100))
            .unwrap();

        let sensor = registry.get("hr-1").unwrap();
        assert_eq!(sensor.value, 72.0);
        assert_eq!(sensor.last_updated, 100);
        assert_eq!(gateway.stats().accepted(), 1);
    }

    #[test]
    fn test_reject_non_finite_value() {
        let (registry, gateway) = gateway();
        let err = gateway
            .ingest("hr-1", SensorKind::HeartRate, f64::NAN, Some(100))
            .unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
        assert!(registry.get("hr-1").is_none());
        assert_eq!(gateway.stats().rejected(), 1);
    }

    #[test]
    fn test_missing_timestamp_uses_server_clock() {
        let (registry, gateway) = gateway();
        gateway
            .ingest("hr-1", SensorKind::HeartRate, 72.0, None)
            .unwrap();
        assert!(registry.get("hr-1").unwrap().last_updated > 0);
    }

    #[test]
    fn test_batch_partial_accept() {
        let (registry, gateway) = gateway();
        let batch = json!({
            "heart_rate": {"sensorId": "hr-1", "value": 72, "timestamp": 100},
            "temperature": {"sensorId": "", "value": 36.6, "timestamp": 100},
            "motion": {"sensorId": "mot-1", "value": "fast", "timestamp": 100},
        });

        let report = gateway.ingest_batch(batch.as_object().unwrap());
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected.len(), 2);
        assert!(registry.get("hr-1").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_batch_unknown_kind_passes_through() {
        let (registry, gateway) = gateway();
        let batch = json!({
            "humidity": {"sensorId": "hum-1", "value": 41.5, "timestamp": 100},
        });

        let report = gateway.ingest_batch(batch.as_object().unwrap());
        assert_eq!(report.accepted, 1);
        assert_eq!(
            registry.get("hum-1").unwrap().kind,
            SensorKind::Other("humidity".to_string())
        );
    }

    #[test]
    fn test_batch_entry_not_an_object() {
        let (_, gateway) = gateway();
        let batch = json!({"heart_rate": 72});
        let report = gateway.ingest_batch(batch.as_object().unwrap());
        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected[0].reason, "entry is not an object");
    }

    #[test]
    fn test_batch_preserves_registry_on_rejects() {
        let (registry, gateway) = gateway();
        gateway
            .ingest("hr-1", SensorKind::HeartRate, 72.0, Some(200))
            .unwrap();

        // A malformed update for an existing sensor must not clobber it.
        let batch = json!({"heart_rate": {"sensorId": "hr-1", "value": null, "timestamp": 300}});
        gateway.ingest_batch(batch.as_object().unwrap());

        let sensor = registry.get("hr-1").unwrap();
        assert_eq!(sensor.value, 72.0);
        assert_eq!(sensor.last_updated, 200);
    }
}
