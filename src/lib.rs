//! Pulse Relay - real-time sensor telemetry distribution.
//!
//! This library is the server-side core behind the UWDF sensor dashboard:
//! it ingests readings from any number of sensor sources, keeps the
//! authoritative per-sensor state, and pushes authorization-filtered
//! snapshots and deltas to connected viewers over WebSockets.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Pulse Relay                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐   ┌────────────────┐   ┌─────────────────┐    │
//! │  │  Ingest  │──▶│ SensorRegistry │──▶│  BroadcastHub   │──▶ viewers
//! │  │ Gateway  │   │  (LWW merge)   │   │ (filtered push) │    │
//! │  └──────────┘   └────────────────┘   └─────────────────┘    │
//! │       ▲                  ▲                    │             │
//! │  sensor sources          │                    ▼             │
//! │  (HTTP / sim)    ┌───────────────┐   ┌───────────────┐      │
//! │                  │    Command    │──▶│    Access     │      │
//! │                  │   Processor   │   │    Control    │      │
//! │                  └───────────────┘   └───────────────┘      │
//! │                          ▲                                  │
//! │                  ┌───────────────┐                          │
//! │                  │    Session    │                          │
//! │                  │ Authenticator │                          │
//! │                  └───────────────┘                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readings flow: source → [`ingest::IngestGateway`] →
//! [`registry::SensorRegistry`] → change event → [`hub::BroadcastHub`] →
//! per-subscriber filtered frame. Commands flow: client →
//! [`auth::SessionAuthenticator`] → [`access::AccessControl`] →
//! [`command::CommandProcessor`] → registry.
//!
//! No subscriber can observe a sensor without a grant, and no slow
//! subscriber can stall delivery to the rest: a lagging stream is resynced
//! with one fresh snapshot instead of an unbounded queue.

pub mod access;
pub mod auth;
pub mod command;
pub mod config;
pub mod hub;
pub mod ingest;
pub mod registry;
pub mod server;
pub mod sim;

// Re-export key types at crate root for convenience
pub use access::{AccessControl, Capability};
pub use auth::{AuthError, CredentialStore, MemoryCredentials, Session, SessionAuthenticator};
pub use command::{CommandAction, CommandProcessor, RejectReason, ToggleCommand};
pub use config::{Config, UserSeed};
pub use hub::{BroadcastHub, HubError, SensorReading, Subscription, TelemetryFrame};
pub use ingest::{IngestGateway, IngestReport};
pub use registry::{Sensor, SensorKind, SensorRegistry};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
