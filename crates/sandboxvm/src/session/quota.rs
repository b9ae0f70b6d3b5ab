//! Admission control: per-identity start rate, per-identity and global
//! active-session ceilings.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// What to do when an identity that already owns a live session calls start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistingSessionPolicy {
    /// Hand back the existing session.
    #[default]
    Reuse,
    /// Refuse with `ALREADY_ACTIVE`.
    Reject,
}

/// Quota ceilings, loaded from the `[quota]` config table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPolicy {
    /// Live sessions across all identities.
    pub max_active_global: usize,
    /// Live sessions per identity.
    pub max_active_per_identity: usize,
    /// Starts per identity inside the sliding window.
    pub max_starts_per_window: usize,
    pub window_seconds: u64,
    pub existing_session: ExistingSessionPolicy,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            max_active_global: 16,
            max_active_per_identity: 1,
            max_starts_per_window: 5,
            window_seconds: 60,
            existing_session: ExistingSessionPolicy::Reuse,
        }
    }
}

impl QuotaPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_active_global == 0
            || self.max_active_per_identity == 0
            || self.max_starts_per_window == 0
        {
            return Err("quota ceilings must be greater than zero".to_string());
        }
        if self.window_seconds == 0 {
            return Err("quota.window_seconds must be greater than zero".to_string());
        }
        if self.max_active_per_identity > self.max_active_global {
            return Err(
                "quota.max_active_per_identity cannot exceed quota.max_active_global".to_string(),
            );
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

/// Which ceiling rejected an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Too many starts inside the window.
    IdentityRate,
    /// The identity already holds its maximum of live sessions.
    IdentityActive,
    /// The service is at capacity.
    GlobalCapacity,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::IdentityRate => "identity_rate",
            RejectReason::IdentityActive => "identity_active",
            RejectReason::GlobalCapacity => "global_capacity",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct IdentityRecord {
    starts: VecDeque<Instant>,
    active: usize,
}

impl IdentityRecord {
    fn forget_before(&mut self, cutoff: Option<Instant>) {
        let Some(cutoff) = cutoff else { return };
        while self.starts.front().is_some_and(|t| *t <= cutoff) {
            self.starts.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.starts.is_empty()
    }
}

#[derive(Debug)]
struct LimiterInner {
    policy: QuotaPolicy,
    identities: DashMap<String, IdentityRecord>,
    active_total: AtomicUsize,
}

impl LimiterInner {
    /// Reserve one global slot without ever exceeding the ceiling.
    fn reserve_global(&self) -> bool {
        self.active_total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.policy.max_active_global).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self, identity: &str) {
        self.active_total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok();
        if let Some(mut record) = self.identities.get_mut(identity) {
            record.active = record.active.saturating_sub(1);
        }
    }
}

/// Rate limiter and quota enforcer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    pub fn new(policy: QuotaPolicy) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                policy,
                identities: DashMap::new(),
                active_total: AtomicUsize::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.inner.policy
    }

    /// Admit one start for `identity`, or say which ceiling refused it.
    ///
    /// The identity checks and counter updates happen under the identity's
    /// map entry, so concurrent calls for one identity are serialized. A
    /// rejection leaves every counter untouched.
    pub fn try_admit(&self, identity: &str) -> Result<QuotaSlot, RejectReason> {
        let result = self.admit(identity, true);
        if result.is_err() {
            self.inner
                .identities
                .remove_if(identity, |_, record| record.is_idle());
        }
        result
    }

    /// Admit a session restored after a restart. The start window is not
    /// charged but the active ceilings still apply.
    pub fn admit_restored(&self, identity: &str) -> Option<QuotaSlot> {
        match self.admit(identity, false) {
            Ok(slot) => Some(slot),
            Err(reason) => {
                debug!(owner = identity, %reason, "restored session not admitted");
                self.inner
                    .identities
                    .remove_if(identity, |_, record| record.is_idle());
                None
            }
        }
    }

    fn admit(&self, identity: &str, count_start: bool) -> Result<QuotaSlot, RejectReason> {
        let policy = &self.inner.policy;
        let now = Instant::now();

        let mut record = self.inner.identities.entry(identity.to_string()).or_default();
        record.forget_before(now.checked_sub(policy.window()));

        if count_start && record.starts.len() >= policy.max_starts_per_window {
            return Err(RejectReason::IdentityRate);
        }
        if record.active >= policy.max_active_per_identity {
            return Err(RejectReason::IdentityActive);
        }
        if !self.inner.reserve_global() {
            return Err(RejectReason::GlobalCapacity);
        }

        if count_start {
            record.starts.push_back(now);
        }
        record.active += 1;
        drop(record);

        Ok(QuotaSlot {
            limiter: Arc::clone(&self.inner),
            identity: identity.to_string(),
            released: AtomicBool::new(false),
        })
    }

    /// Live sessions across all identities.
    pub fn active_total(&self) -> usize {
        self.inner.active_total.load(Ordering::Acquire)
    }

    pub fn active_for(&self, identity: &str) -> usize {
        self.inner
            .identities
            .get(identity)
            .map(|r| r.active)
            .unwrap_or(0)
    }

    /// Drop records of identities with no live session and no recent start.
    pub fn prune(&self) -> usize {
        let cutoff = Instant::now().checked_sub(self.inner.policy.window());
        let before = self.inner.identities.len();
        self.inner.identities.retain(|_, record| {
            record.forget_before(cutoff);
            !record.is_idle()
        });
        before.saturating_sub(self.inner.identities.len())
    }
}

/// One admitted session's share of the quota. Released exactly once, either
/// explicitly or on drop.
#[derive(Debug)]
pub struct QuotaSlot {
    limiter: Arc<LimiterInner>,
    identity: String,
    released: AtomicBool,
}

impl QuotaSlot {
    /// Give the slot back. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.limiter.release(&self.identity);
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for QuotaSlot {
    fn drop(&mut self) {
        self.release();
    }
}
