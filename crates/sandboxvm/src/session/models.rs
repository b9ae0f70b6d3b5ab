//! Session data models and the lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{SessionError, SessionResult};
use crate::limits::ResourceLimits;
use crate::runtime::InstanceHandle;

/// Public session id prefix.
pub const SESSION_ID_PREFIX: &str = "vm_";

/// Generate a fresh public session id (`vm_` + 32 hex chars).
pub fn new_session_id() -> String {
    format!("{}{}", SESSION_ID_PREFIX, Uuid::new_v4().simple())
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Admitted, nothing provisioned yet.
    Requested,
    /// Instance is being created and started.
    Provisioning,
    /// Instance is up and accepts commands.
    Running,
    /// Deadline passed; teardown is pending or in progress.
    Expiring,
    /// Teardown in progress.
    Stopping,
    /// Instance stopped; removal may still be pending.
    Stopped,
    /// Instance removed.
    Destroyed,
    /// Provisioning or teardown failed.
    Failed,
}

impl SessionState {
    /// Terminal states never change again, except for the final move to
    /// `Destroyed` once a leftover instance has been removed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Stopped | SessionState::Destroyed | SessionState::Failed
        )
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self -> next` is an allowed edge.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Requested, Provisioning | Failed)
                | (Provisioning, Running | Failed)
                | (Running, Expiring | Stopping | Failed | Destroyed)
                | (Expiring, Stopping | Failed | Destroyed)
                | (Stopping, Stopped | Failed | Destroyed)
                | (Stopped, Destroyed)
                | (Failed, Destroyed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Requested => write!(f, "requested"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Running => write!(f, "running"),
            SessionState::Expiring => write!(f, "expiring"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Destroyed => write!(f, "destroyed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requested" => Ok(SessionState::Requested),
            "provisioning" => Ok(SessionState::Provisioning),
            "running" => Ok(SessionState::Running),
            "expiring" => Ok(SessionState::Expiring),
            "stopping" => Ok(SessionState::Stopping),
            "stopped" => Ok(SessionState::Stopped),
            "destroyed" => Ok(SessionState::Destroyed),
            "failed" => Ok(SessionState::Failed),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionState {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One sandbox session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Public id handed to the client.
    pub id: String,
    /// Caller identity that created the session.
    pub owner: String,
    pub state: SessionState,
    /// Runtime instance. Private; never serialized into responses.
    pub runtime_handle: Option<InstanceHandle>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// When a terminal state was first reached.
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Snapshot of the limit policy at creation.
    pub limits: ResourceLimits,
}

impl Session {
    pub fn new(id: String, owner: String, limits: ResourceLimits, now: DateTime<Utc>) -> Self {
        let expires_at = (now + limits.default_ttl()).min(now + limits.max_total_ttl());
        Self {
            id,
            owner,
            state: SessionState::Requested,
            runtime_handle: None,
            created_at: now,
            last_activity_at: now,
            expires_at,
            ended_at: None,
            error_message: None,
            limits,
        }
    }

    /// Latest deadline any number of extensions can reach.
    pub fn max_expires_at(&self) -> DateTime<Utc> {
        self.created_at + self.limits.max_total_ttl()
    }

    /// Initial deadline once the instance is running.
    pub fn initial_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        (now + self.limits.default_ttl()).min(self.max_expires_at())
    }

    /// Deadline after extending by `delta_seconds`, clamped to the lifetime cap.
    pub fn extended_expiry(&self, delta_seconds: i64) -> DateTime<Utc> {
        let delta = chrono::Duration::try_seconds(delta_seconds).unwrap_or(chrono::Duration::MAX);
        self.expires_at
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .min(self.max_expires_at())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// State as reported to clients: a running session past its deadline
    /// shows as `expiring` until the reaper claims it.
    pub fn effective_state(&self, now: DateTime<Utc>) -> SessionState {
        if self.state == SessionState::Running && self.is_expired(now) {
            SessionState::Expiring
        } else {
            self.state
        }
    }

    /// Apply a state transition, stamping `ended_at` on the first terminal state.
    pub fn transition(&mut self, next: SessionState, now: DateTime<Utc>) -> SessionResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidState(format!(
                "cannot move session from {} to {}",
                self.state, next
            )));
        }
        self.state = next;
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        SessionView {
            session_id: self.id.clone(),
            state: self.effective_state(now),
            created_at: self.created_at,
            expires_at: self.expires_at,
            last_activity_at: self.last_activity_at,
        }
    }
}

/// Client-facing snapshot of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Result of `start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub session: SessionView,
    /// True when an existing live session was returned instead of a new one.
    pub reused: bool,
}
