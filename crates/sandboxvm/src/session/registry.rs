//! In-memory session registry.
//!
//! The map itself is a [`DashMap`] whose shard guards are only held for
//! insert, lookup and remove. Each entry carries its own execution lock
//! (held across runtime calls) and a short-lived record lock (never held
//! across an `.await`).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use super::error::SessionResult;
use super::models::{Session, SessionState};
use super::quota::QuotaSlot;
use crate::runtime::InstanceHandle;

/// One registered session.
#[derive(Debug)]
pub struct SessionEntry {
    id: String,
    owner: String,
    /// Serializes execute, extend, stop, teardown and provisioning.
    execution: Mutex<()>,
    record: RwLock<Session>,
    slot: QuotaSlot,
}

impl SessionEntry {
    pub fn new(session: Session, slot: QuotaSlot) -> Self {
        Self {
            id: session.id.clone(),
            owner: session.owner.clone(),
            execution: Mutex::new(()),
            record: RwLock::new(session),
            slot,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.record.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.record.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    /// Read the record without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&Session) -> R) -> R {
        f(&self.read())
    }

    pub fn state(&self) -> SessionState {
        self.read().state
    }

    pub fn handle(&self) -> Option<InstanceHandle> {
        self.read().runtime_handle.clone()
    }

    /// Mutate the record in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.write())
    }

    /// Move to `next`; the quota slot is given back on the first terminal state.
    pub fn transition(&self, next: SessionState, now: DateTime<Utc>) -> SessionResult<()> {
        self.write().transition(next, now)?;
        if next.is_terminal() {
            self.slot.release();
        }
        Ok(())
    }

    pub fn quota_released(&self) -> bool {
        self.slot.is_released()
    }

    /// Wait for the execution lock.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.execution.lock().await
    }

    /// Take the execution lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.execution.try_lock().ok()
    }
}

/// All sessions known to this process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<SessionEntry>) {
        self.sessions.insert(entry.id().to_string(), entry);
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Look up a session on behalf of `owner`. Foreign sessions are
    /// indistinguishable from unknown ones.
    pub fn get_owned(&self, id: &str, owner: &str) -> Option<Arc<SessionEntry>> {
        self.get(id).filter(|entry| entry.owner() == owner)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.remove(id).map(|(_, entry)| entry)
    }

    /// Copy of every entry, so callers can await without holding shard guards.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// First non-terminal session owned by `owner`.
    pub fn find_live_by_owner(&self, owner: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .find(|e| e.owner() == owner && e.state().is_live())
            .map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session counts keyed by (stored) state.
    pub fn counts_by_state(&self) -> BTreeMap<SessionState, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.sessions.iter() {
            *counts.entry(entry.state()).or_insert(0) += 1;
        }
        counts
    }
}
