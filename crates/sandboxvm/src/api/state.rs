//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    /// Take the caller identity from `X-Forwarded-For`.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(sessions: Arc<SessionService>) -> Self {
        Self {
            sessions,
            trust_forwarded_for: false,
        }
    }

    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }
}
