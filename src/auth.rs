//! Credential checks and session tokens.
//!
//! Credential storage sits behind the [`CredentialStore`] trait; the in-tree
//! [`MemoryCredentials`] is a plain-comparison store for development and
//! tests, and a deployment may substitute a hashing-backed implementation.
//! Sessions are opaque 256-bit random tokens bound to exactly one user.
//!
//! Login failure is deliberately generic: the caller cannot distinguish an
//! unknown user from a wrong secret, and secrets never appear in logs or
//! error values.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// Verifies a user's secret. Storage and hashing live behind this boundary.
pub trait CredentialStore: Send + Sync {
    fn verify(&self, user_id: &str, secret: &str) -> bool;
}

/// In-memory credential store.
///
/// Secrets are held as provided; only `verify` exposes any information about
/// them, and only as a boolean.
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    secrets: DashMap<String, String>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user's secret.
    pub fn upsert_user(&self, user_id: &str, secret: &str) {
        self.secrets.insert(user_id.to_string(), secret.to_string());
    }
}

impl CredentialStore for MemoryCredentials {
    fn verify(&self, user_id: &str, secret: &str) -> bool {
        self.secrets
            .get(user_id)
            .map(|stored| stored.as_str() == secret)
            .unwrap_or(false)
    }
}

/// A live session bound to one user.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|expiry| now >= expiry).unwrap_or(false)
    }
}

/// Authentication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Bad credentials. Intentionally does not say which part was wrong.
    Failed,
    /// Token is unknown.
    Invalid,
    /// Token was valid but has expired.
    Expired,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Failed => write!(f, "authentication failed"),
            AuthError::Invalid => write!(f, "invalid session"),
            AuthError::Expired => write!(f, "session expired"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Issues and validates session tokens.
pub struct SessionAuthenticator {
    credentials: Arc<dyn CredentialStore>,
    sessions: DashMap<String, Session>,
    ttl: Option<Duration>,
}

impl SessionAuthenticator {
    /// `ttl` of `None` means sessions last until logout or disconnect.
    pub fn new(credentials: Arc<dyn CredentialStore>, ttl: Option<Duration>) -> Self {
        Self {
            credentials,
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Validate credentials and issue a session.
    pub fn login(&self, user_id: &str, secret: &str) -> Result<Session, AuthError> {
        if !self.credentials.verify(user_id, secret) {
            return Err(AuthError::Failed);
        }

        let now = Utc::now();
        let session = Session {
            token: generate_token(),
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: self
                .ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
        };
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    /// Resolve a token to its session. Expired sessions are purged on sight.
    pub fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let expired = match self.sessions.get(token) {
            Some(session) => {
                if session.is_expired(Utc::now()) {
                    true
                } else {
                    return Ok(session.clone());
                }
            }
            None => return Err(AuthError::Invalid),
        };

        if expired {
            self.sessions.remove(token);
        }
        Err(AuthError::Expired)
    }

    /// Destroy a session. Unknown tokens are a no-op.
    pub fn logout(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    /// Number of live sessions (expired ones may linger until observed).
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// 32 bytes from the OS RNG, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let mut token = String::with_capacity(64);
    for byte in bytes {
        let _ = write!(token, "{byte:02x}");
    }
    token
}
