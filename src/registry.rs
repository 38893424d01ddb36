//! Authoritative in-memory sensor table.
//!
//! The registry is the single writer-of-record for sensor state. Writes are
//! atomic per sensor (sharded map entries), so updates to different sensors
//! never contend. Every effective mutation is published on a broadcast
//! channel consumed by live subscriber streams.
//!
//! Ordering: concurrent value writes to the same sensor resolve by source
//! timestamp (last-writer-wins), not by arrival order. A write carrying a
//! timestamp older than the stored one is ignored and emits no event.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Category of a sensor reading. Open-ended: labels the relay does not
/// recognize pass through unchanged as [`SensorKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SensorKind {
    HeartRate,
    Temperature,
    Motion,
    Other(String),
}

impl SensorKind {
    /// Parse a wire label into a kind.
    pub fn parse(label: &str) -> Self {
        match label {
            "heart_rate" => SensorKind::HeartRate,
            "temperature" => SensorKind::Temperature,
            "motion" => SensorKind::Motion,
            other => SensorKind::Other(other.to_string()),
        }
    }

    /// The wire label for this kind.
    pub fn label(&self) -> &str {
        match self {
            SensorKind::HeartRate => "heart_rate",
            SensorKind::Temperature => "temperature",
            SensorKind::Motion => "motion",
            SensorKind::Other(label) => label,
        }
    }
}

impl From<String> for SensorKind {
    fn from(label: String) -> Self {
        SensorKind::parse(&label)
    }
}

impl From<SensorKind> for String {
    fn from(kind: SensorKind) -> Self {
        kind.label().to_string()
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A single sensor record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Stable unique identity. Immutable once created.
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    /// Reading category (unit is implied by the kind, client-side).
    pub kind: SensorKind,
    /// Latest reading.
    pub value: f64,
    /// Whether the sensor is currently active.
    pub active: bool,
    /// Source timestamp of the latest accepted write, in milliseconds.
    /// Non-decreasing under concurrent writes.
    #[serde(rename = "timestamp")]
    pub last_updated: i64,
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    NotFound(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "unknown sensor: {id}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Thread-safe table of sensor records.
///
/// Sensors are created on first ingest and never deleted; a deactivated
/// sensor persists with `active = false`.
#[derive(Debug)]
pub struct SensorRegistry {
    sensors: DashMap<String, Sensor>,
    changes: broadcast::Sender<Sensor>,
}

impl SensorRegistry {
    /// Create a registry whose change channel buffers up to `change_capacity`
    /// undelivered events per subscriber before the subscriber lags.
    pub fn new(change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity);
        Self {
            sensors: DashMap::new(),
            changes,
        }
    }

    /// Look up a sensor by id.
    pub fn get(&self, sensor_id: &str) -> Option<Sensor> {
        self.sensors.get(sensor_id).map(|s| s.value().clone())
    }

    /// Create or update a sensor from an ingested reading.
    ///
    /// A new sensor starts active. For an existing sensor the write is
    /// applied only if `timestamp` is not older than the stored one;
    /// stale writes return the current record unchanged.
    pub fn upsert(&self, sensor_id: &str, kind: SensorKind, value: f64, timestamp: i64) -> Sensor {
        let (sensor, changed) = match self.sensors.entry(sensor_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let sensor = occupied.get_mut();
                if timestamp >= sensor.last_updated {
                    sensor.kind = kind;
                    sensor.value = value;
                    sensor.last_updated = timestamp;
                    (sensor.clone(), true)
                } else {
                    (sensor.clone(), false)
                }
            }
            Entry::Vacant(vacant) => {
                let sensor = Sensor {
                    sensor_id: sensor_id.to_string(),
                    kind,
                    value,
                    active: true,
                    last_updated: timestamp,
                };
                vacant.insert(sensor.clone());
                (sensor, true)
            }
        };

        if changed {
            let _ = self.changes.send(sensor.clone());
        }
        sensor
    }

    /// Set the active flag of an existing sensor.
    ///
    /// Setting the flag to its current value is a no-op success and emits no
    /// change event. `last_updated` is never touched here; it tracks reading
    /// timestamps only.
    pub fn set_active(&self, sensor_id: &str, active: bool) -> Result<Sensor, RegistryError> {
        let (sensor, changed) = match self.sensors.get_mut(sensor_id) {
            Some(mut sensor) => {
                if sensor.active == active {
                    (sensor.clone(), false)
                } else {
                    sensor.active = active;
                    (sensor.clone(), true)
                }
            }
            None => return Err(RegistryError::NotFound(sensor_id.to_string())),
        };

        if changed {
            let _ = self.changes.send(sensor.clone());
        }
        Ok(sensor)
    }

    /// Point-in-time copy of all sensors, ordered by id.
    pub fn snapshot(&self) -> Vec<Sensor> {
        let mut sensors: Vec<Sensor> = self.sensors.iter().map(|s| s.value().clone()).collect();
        sensors.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        sensors
    }

    /// True if another sensor (different id) carries the same kind.
    pub fn kind_is_shared(&self, kind: &SensorKind, excluding_id: &str) -> bool {
        self.sensors
            .iter()
            .any(|s| s.kind == *kind && s.sensor_id != excluding_id)
    }

    /// Subscribe to change events. Each effective mutation (accepted upsert
    /// or active-flag flip) delivers the updated record.
    pub fn subscribe(&self) -> broadcast::Receiver<Sensor> {
        self.changes.subscribe()
    }

    /// Number of known sensors.
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}
