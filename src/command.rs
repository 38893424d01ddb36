//! Activation/deactivation command pipeline.
//!
//! Every command resolves its session, passes an authorization check, then
//! lands on the registry. Commands are idempotent by target state: activating
//! an already-active sensor succeeds without changing anything.

use crate::access::{AccessControl, Capability};
use crate::auth::SessionAuthenticator;
use crate::registry::{Sensor, SensorRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A toggle request as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ToggleCommand {
    #[serde(rename = "sensorId")]
    pub sensor_id: String,
    pub action: CommandAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Activate,
    Deactivate,
}

/// Why a command was rejected. Rejections are terminal for the triggering
/// request only; they never affect the connection or other commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Missing, invalid, or expired session.
    Unauthenticated,
    /// Valid session without a Mutate grant on the target.
    Forbidden,
    /// Unknown sensor id.
    NotFound,
}

impl RejectReason {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Unauthenticated => "unauthenticated",
            RejectReason::Forbidden => "forbidden",
            RejectReason::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for RejectReason {}

/// Validates and applies sensor commands.
pub struct CommandProcessor {
    auth: Arc<SessionAuthenticator>,
    access: Arc<AccessControl>,
    registry: Arc<SensorRegistry>,
}

impl CommandProcessor {
    pub fn new(
        auth: Arc<SessionAuthenticator>,
        access: Arc<AccessControl>,
        registry: Arc<SensorRegistry>,
    ) -> Self {
        Self {
            auth,
            access,
            registry,
        }
    }

    /// Apply a toggle command on behalf of `token`.
    ///
    /// Concurrent commands on the same sensor serialize through the
    /// registry's per-sensor entry; the surviving state is that of whichever
    /// write lands last, which may differ from network arrival order. Callers
    /// needing FIFO semantics must serialize on their side.
    pub fn apply(
        &self,
        token: &str,
        sensor_id: &str,
        action: CommandAction,
    ) -> Result<Sensor, RejectReason> {
        let session = self
            .auth
            .validate(token)
            .map_err(|_| RejectReason::Unauthenticated)?;

        if !self
            .access
            .is_authorized(&session.user_id, sensor_id, Capability::Mutate)
        {
            return Err(RejectReason::Forbidden);
        }

        let active = matches!(action, CommandAction::Activate);
        self.registry
            .set_active(sensor_id, active)
            .map_err(|_| RejectReason::NotFound)
    }
}
