//! Fan-out of sensor changes to live subscriber streams.
//!
//! Every subscription gets its own receiver on the registry's broadcast
//! channel, so a slow consumer can never stall delivery to others. The
//! per-connection task pushes a full authorization-filtered snapshot first,
//! then incremental frames for sensors the bound user may view. When a
//! receiver falls behind far enough to lose events, the lost deltas are
//! coalesced into one fresh snapshot instead of buffering without bound.
//!
//! Frames are JSON objects keyed by sensor name: the sensor's kind label, or
//! `"<kind>:<id>"` when several sensors share a kind, so a snapshot is always
//! total (no omissions, no key collisions).

use crate::access::{AccessControl, Capability};
use crate::auth::Session;
use crate::registry::{Sensor, SensorRegistry};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Wire form of one sensor inside a telemetry frame. The kind is the frame
/// key, not part of the value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: i64,
    pub active: bool,
}

impl From<&Sensor> for SensorReading {
    fn from(sensor: &Sensor) -> Self {
        Self {
            sensor_id: sensor.sensor_id.clone(),
            value: sensor.value,
            timestamp: sensor.last_updated,
            active: sensor.active,
        }
    }
}

/// One outgoing push: sensor name -> reading.
pub type TelemetryFrame = BTreeMap<String, SensorReading>;

/// Subscription errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// Subscriber limit reached; new connections are rejected, not queued.
    AtCapacity,
    /// The session token already backs a live stream.
    TokenInUse,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::AtCapacity => write!(f, "subscriber capacity reached"),
            HubError::TokenInUse => write!(f, "session already has a live stream"),
        }
    }
}

impl std::error::Error for HubError {}

#[derive(Debug)]
struct SubscriberEntry {
    user_id: String,
    connected_at: DateTime<Utc>,
}

struct HubInner {
    registry: Arc<SensorRegistry>,
    access: Arc<AccessControl>,
    subscribers: DashMap<Uuid, SubscriberEntry>,
    by_token: DashMap<String, Uuid>,
    max_subscribers: usize,
}

/// Tracks live subscribers and builds their filtered views.
/// Cheap to clone; clones share one subscriber set.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(
        registry: Arc<SensorRegistry>,
        access: Arc<AccessControl>,
        max_subscribers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry,
                access,
                subscribers: DashMap::new(),
                by_token: DashMap::new(),
                max_subscribers,
            }),
        }
    }

    /// Register a live connection for `session`.
    ///
    /// The returned [`Subscription`] holds its own change receiver, created
    /// here so no update between subscription and the first snapshot push can
    /// be missed. Dropping it removes the subscriber.
    pub fn subscribe(&self, session: &Session) -> Result<Subscription, HubError> {
        if self.inner.subscribers.len() >= self.inner.max_subscribers {
            return Err(HubError::AtCapacity);
        }

        let id = Uuid::new_v4();
        match self.inner.by_token.entry(session.token.clone()) {
            Entry::Occupied(_) => return Err(HubError::TokenInUse),
            Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }
        self.inner.subscribers.insert(
            id,
            SubscriberEntry {
                user_id: session.user_id.clone(),
                connected_at: Utc::now(),
            },
        );
        tracing::info!(user = %session.user_id, subscriber = %id, "stream subscribed");

        Ok(Subscription {
            id,
            user_id: session.user_id.clone(),
            token: session.token.clone(),
            hub: self.clone(),
            rx: self.inner.registry.subscribe(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Full authorization-filtered snapshot for one user.
    pub fn snapshot_for(&self, user_id: &str) -> TelemetryFrame {
        let sensors = self.inner.registry.snapshot();
        let mut frame = TelemetryFrame::new();
        for sensor in &sensors {
            if self
                .inner
                .access
                .is_authorized(user_id, &sensor.sensor_id, Capability::View)
            {
                frame.insert(self.frame_key(sensor), SensorReading::from(sensor));
            }
        }
        frame
    }

    /// Single-sensor delta frame.
    fn delta_for(&self, sensor: &Sensor) -> TelemetryFrame {
        let mut frame = TelemetryFrame::new();
        frame.insert(self.frame_key(sensor), SensorReading::from(sensor));
        frame
    }

    /// A sensor's frame key: the kind label while it is unique across the
    /// registry, otherwise `"<kind>:<id>"`. The rule is global (not
    /// per-viewer) so snapshot and delta keys always agree.
    fn frame_key(&self, sensor: &Sensor) -> String {
        if self
            .inner
            .registry
            .kind_is_shared(&sensor.kind, &sensor.sensor_id)
        {
            format!("{}:{}", sensor.kind.label(), sensor.sensor_id)
        } else {
            sensor.kind.label().to_string()
        }
    }

    fn unsubscribe(&self, id: Uuid, token: &str) {
        if let Some((_, entry)) = self.inner.subscribers.remove(&id) {
            let connected_for = Utc::now() - entry.connected_at;
            tracing::info!(
                user = %entry.user_id,
                subscriber = %id,
                secs = connected_for.num_seconds(),
                "stream unsubscribed"
            );
        }
        self.inner.by_token.remove(token);
    }
}

/// One live stream, bound to a session for the connection's lifetime.
pub struct Subscription {
    id: Uuid,
    user_id: String,
    token: String,
    hub: BroadcastHub,
    rx: broadcast::Receiver<Sensor>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The complete filtered view right now. Pushed once on connect, and
    /// again whenever this subscriber falls behind.
    pub fn snapshot_frame(&self) -> TelemetryFrame {
        self.hub.snapshot_for(&self.user_id)
    }

    /// Wait for the next frame to push.
    ///
    /// Changes to sensors this user may not view are skipped. A lagged
    /// receiver yields a fresh full snapshot covering everything the dropped
    /// deltas said and more. Returns `None` once the change channel closes.
    pub async fn next_frame(&mut self) -> Option<TelemetryFrame> {
        loop {
            match self.rx.recv().await {
                Ok(sensor) => {
                    if self.hub.inner.access.is_authorized(
                        &self.user_id,
                        &sensor.sensor_id,
                        Capability::View,
                    ) {
                        return Some(self.hub.delta_for(&sensor));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        user = %self.user_id,
                        skipped,
                        "slow subscriber, coalescing to snapshot"
                    );
                    return Some(self.snapshot_frame());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id, &self.token);
    }
}
