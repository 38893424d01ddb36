//! Simulated sensor sources.
//!
//! Stands in for the hardware fleet when running without devices. Each
//! simulated sensor runs on its own OS thread and emits readings over a
//! crossbeam channel; a bridge thread drains the channel into the ingest
//! gateway, so simulated readings take the exact same path as posted ones.

use crate::ingest::IngestGateway;
use crate::registry::SensorKind;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Channel capacity between sensor threads and the bridge.
const READING_BUFFER: usize = 256;

/// One simulated sensor: readings wander around `base` within `amplitude`.
#[derive(Debug, Clone)]
pub struct SimSensor {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub base: f64,
    pub amplitude: f64,
    pub interval: Duration,
}

/// A reading on its way to the gateway.
#[derive(Debug, Clone)]
pub struct SimReading {
    pub sensor_id: String,
    pub kind: SensorKind,
    pub value: f64,
    pub timestamp: i64,
}

/// The default simulated fleet: one sensor per built-in kind.
pub fn default_fleet() -> Vec<SimSensor> {
    vec![
        SimSensor {
            sensor_id: "hr-1".to_string(),
            kind: SensorKind::HeartRate,
            base: 72.0,
            amplitude: 8.0,
            interval: Duration::from_millis(800),
        },
        SimSensor {
            sensor_id: "temp-1".to_string(),
            kind: SensorKind::Temperature,
            base: 36.6,
            amplitude: 0.4,
            interval: Duration::from_millis(2000),
        },
        SimSensor {
            sensor_id: "mot-1".to_string(),
            kind: SensorKind::Motion,
            base: 0.3,
            amplitude: 0.3,
            interval: Duration::from_millis(500),
        },
    ]
}

/// Running simulator. Stop with [`Simulator::stop`].
pub struct Simulator {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Simulator {
    /// Spawn one thread per sensor plus the bridge into the gateway.
    pub fn start(sensors: Vec<SimSensor>, gateway: Arc<IngestGateway>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded::<SimReading>(READING_BUFFER);

        let mut handles = Vec::with_capacity(sensors.len() + 1);
        for sensor in sensors {
            handles.push(spawn_sensor(sensor, tx.clone(), Arc::clone(&stop)));
        }
        // The bridge exits once every sensor thread has dropped its sender.
        drop(tx);
        handles.push(spawn_bridge(rx, gateway));

        Self { stop, handles }
    }

    /// Signal all threads and wait for them to finish.
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn_sensor(sensor: SimSensor, tx: Sender<SimReading>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut rng = rand::thread_rng();
        while !stop.load(Ordering::SeqCst) {
            let noise: f64 = rng.gen_range(-1.0..=1.0);
            let value = (sensor.base + sensor.amplitude * noise).max(0.0);
            let reading = SimReading {
                sensor_id: sensor.sensor_id.clone(),
                kind: sensor.kind.clone(),
                value,
                timestamp: Utc::now().timestamp_millis(),
            };
            if tx.send(reading).is_err() {
                break;
            }
            thread::sleep(sensor.interval);
        }
    })
}

fn spawn_bridge(rx: Receiver<SimReading>, gateway: Arc<IngestGateway>) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(reading) = rx.recv() {
            if let Err(e) = gateway.ingest(
                &reading.sensor_id,
                reading.kind,
                reading.value,
                Some(reading.timestamp),
            ) {
                tracing::warn!(sensor = %reading.sensor_id, "simulated reading rejected: {e}");
            }
        }
    })
}
