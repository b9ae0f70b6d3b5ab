//! Session management.
//!
//! Sessions are short-lived sandboxes owned by an anonymous caller identity.
//! [`SessionService`] admits them through the [`RateLimiter`], provisions an
//! instance through the runtime adapter, runs commands through the
//! [`ExecutionGateway`] and tears everything down on stop or expiry. The
//! [`Reaper`] makes sure the last part happens even when clients disappear.

mod error;
mod gateway;
mod models;
mod quota;
mod reaper;
mod registry;
mod service;
mod store;

pub use error::{SessionError, SessionResult};
pub use gateway::{DEFAULT_GRACE, ExecutionGateway, ExecutionResult, TIMEOUT_EXIT_CODE};
pub use models::{Session, SessionState, SessionView, StartOutcome, new_session_id};
pub use quota::{ExistingSessionPolicy, QuotaPolicy, QuotaSlot, RateLimiter, RejectReason};
pub use reaper::{Reaper, ReaperHandle, ReconcileReport, SweepReport};
pub use registry::{SessionEntry, SessionRegistry};
pub use service::{ServiceStats, SessionService};
pub use store::{NoopSessionStore, SessionStore, SqliteSessionStore};
