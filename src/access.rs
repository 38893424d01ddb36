//! Per-user sensor authorization.
//!
//! Maps a user to the set of sensors they may observe or toggle. The grant
//! table is the authorization plane's source of truth; the sensor registry
//! knows nothing about users. Default-deny: no grant means no capability.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a grant allows. `Mutate` implies `View`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    View,
    Mutate,
}

/// User-to-sensor grant table.
///
/// Grants are additive: re-granting a sensor keeps the stronger capability.
/// Admin users bypass per-sensor checks entirely.
#[derive(Debug, Default)]
pub struct AccessControl {
    grants: DashMap<String, HashMap<String, Capability>>,
    admins: DashSet<String>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark or unmark a user as administrative.
    pub fn set_admin(&self, user_id: &str, admin: bool) {
        if admin {
            self.admins.insert(user_id.to_string());
        } else {
            self.admins.remove(user_id);
        }
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    /// Check whether `user_id` holds `capability` on `sensor_id`.
    pub fn is_authorized(&self, user_id: &str, sensor_id: &str, capability: Capability) -> bool {
        if self.is_admin(user_id) {
            return true;
        }
        self.grants
            .get(user_id)
            .and_then(|sensors| sensors.get(sensor_id).copied())
            .map(|granted| granted >= capability)
            .unwrap_or(false)
    }

    /// Add grants for a user. Existing grants are upgraded, never downgraded.
    pub fn grant(&self, user_id: &str, sensor_ids: &[String], capability: Capability) {
        let mut sensors = self.grants.entry(user_id.to_string()).or_default();
        for sensor_id in sensor_ids {
            let granted = sensors.entry(sensor_id.clone()).or_insert(capability);
            if capability > *granted {
                *granted = capability;
            }
        }
    }

    /// Remove grants for a user. Unknown sensor ids are ignored.
    pub fn revoke(&self, user_id: &str, sensor_ids: &[String]) {
        if let Some(mut sensors) = self.grants.get_mut(user_id) {
            for sensor_id in sensor_ids {
                sensors.remove(sensor_id);
            }
        }
    }

    /// Sensor ids granted to a user, sorted. Empty for unknown users.
    pub fn list_granted(&self, user_id: &str) -> Vec<String> {
        let mut sensor_ids: Vec<String> = self
            .grants
            .get(user_id)
            .map(|sensors| sensors.keys().cloned().collect())
            .unwrap_or_default();
        sensor_ids.sort();
        sensor_ids
    }
}
