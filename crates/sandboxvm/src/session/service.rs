//! Session service - drives sandbox instances through their lifecycle.
//!
//! Every operation that touches a runtime instance holds that session's
//! execution lock for the whole call, so a handle is never used by two
//! operations at once. The reaper steps at the bottom of this file follow
//! the same rule and are called from [`super::reaper::Reaper`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{SessionError, SessionResult};
use super::gateway::{ExecutionGateway, ExecutionResult, validate_command};
use super::models::{Session, SessionState, SessionView, StartOutcome, new_session_id};
use super::quota::{ExistingSessionPolicy, RateLimiter};
use super::reaper::{ReconcileReport, SweepReport};
use super::registry::{SessionEntry, SessionRegistry};
use super::store::SessionStore;
use crate::config::{AppConfig, LifecycleConfig, ReaperConfig};
use crate::limits::ResourceLimits;
use crate::runtime::{
    InstanceHandle, InstanceSpec, InstanceState, ManagedInstance, RuntimeAdapter, RuntimeError,
    RuntimeResult,
};

/// Counters for the health endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    /// Registered sessions, tombstones included.
    pub sessions: usize,
    /// Sessions holding a quota slot.
    pub active: usize,
    /// Global ceiling on active sessions.
    pub capacity: usize,
    pub by_state: BTreeMap<String, usize>,
}

pub struct SessionService {
    registry: SessionRegistry,
    limiter: RateLimiter,
    runtime: Arc<dyn RuntimeAdapter>,
    gateway: ExecutionGateway,
    store: Arc<dyn SessionStore>,
    limits: ResourceLimits,
    lifecycle: LifecycleConfig,
    reaper: ReaperConfig,
    name_prefix: String,
}

impl SessionService {
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn RuntimeAdapter>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            limiter: RateLimiter::new(config.quota.clone()),
            gateway: ExecutionGateway::new(Arc::clone(&runtime)),
            runtime,
            store,
            limits: config.limits.clone(),
            lifecycle: config.lifecycle.clone(),
            reaper: config.reaper.clone(),
            name_prefix: config.runtime.name_prefix.clone(),
        }
    }

    /// Change the grace the gateway allows past the execution timeout.
    pub fn with_exec_grace(mut self, grace: Duration) -> Self {
        self.gateway = self.gateway.with_grace(grace);
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeAdapter> {
        &self.runtime
    }

    pub fn reaper_config(&self) -> &ReaperConfig {
        &self.reaper
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    /// Start a session for `identity`, or hand back its live one.
    pub async fn start(&self, identity: &str) -> SessionResult<StartOutcome> {
        let now = Utc::now();

        if let Some(existing) = self.registry.find_live_by_owner(identity) {
            match self.limiter.policy().existing_session {
                ExistingSessionPolicy::Reject => {
                    return Err(SessionError::AlreadyActive(existing.id().to_string()));
                }
                ExistingSessionPolicy::Reuse => {
                    let reusable =
                        existing.with(|s| s.state == SessionState::Running && !s.is_expired(now));
                    if reusable {
                        info!(session_id = existing.id(), owner = identity, "reusing live session");
                        return Ok(StartOutcome {
                            session: existing.with(|s| s.view(now)),
                            reused: true,
                        });
                    }
                }
            }
        }

        let slot = self.limiter.try_admit(identity).map_err(|reason| {
            info!(owner = identity, %reason, "start rejected");
            SessionError::QuotaExceeded(reason)
        })?;

        let session = Session::new(new_session_id(), identity.to_string(), self.limits.clone(), now);
        let entry = Arc::new(SessionEntry::new(session, slot));

        // Locked before it becomes visible, so nothing else can act on it
        // until provisioning has finished one way or the other.
        let _guard = entry.lock().await;
        self.registry.insert(Arc::clone(&entry));
        entry.transition(SessionState::Provisioning, Utc::now())?;
        self.persist(&entry).await;

        match self.provision(&entry).await {
            Ok(()) => {
                self.persist(&entry).await;
                let view = entry.with(|s| s.view(Utc::now()));
                info!(
                    session_id = entry.id(),
                    owner = identity,
                    expires_at = %view.expires_at,
                    "session running"
                );
                Ok(StartOutcome {
                    session: view,
                    reused: false,
                })
            }
            Err(e) => {
                warn!(session_id = entry.id(), owner = identity, "provisioning failed: {}", e);
                self.fail(&entry, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Run a command in a running session.
    pub async fn execute(
        &self,
        identity: &str,
        id: &str,
        command: &str,
    ) -> SessionResult<ExecutionResult> {
        let entry = self.lookup(identity, id)?;
        let limits = entry.with(|s| s.limits.clone());
        validate_command(command, &limits)?;
        check_active(&entry, Utc::now())?;

        let _guard = entry.lock().await;
        check_active(&entry, Utc::now())?;
        let handle = running_handle(&entry)?;

        let result = match self.gateway.run(&handle, command, &limits).await {
            Ok(result) => result,
            Err(e) => {
                let lost = matches!(e, SessionError::RuntimeFailed(_))
                    && !self.instance_running(&handle).await;
                if lost {
                    warn!(
                        session_id = entry.id(),
                        handle = %handle,
                        "instance is no longer running: {}", e
                    );
                    self.fail(&entry, &format!("instance lost: {e}")).await;
                }
                return Err(e);
            }
        };
        entry.update(|s| s.last_activity_at = Utc::now());

        debug!(
            session_id = entry.id(),
            exit_code = result.exit_code,
            truncated = result.truncated,
            "command finished"
        );
        Ok(result)
    }

    /// Push the deadline back by `delta_seconds`, capped at the lifetime limit.
    pub async fn extend(
        &self,
        identity: &str,
        id: &str,
        delta_seconds: i64,
    ) -> SessionResult<DateTime<Utc>> {
        if delta_seconds <= 0 {
            return Err(SessionError::BadRequest(
                "deltaSeconds must be greater than zero".to_string(),
            ));
        }

        let entry = self.lookup(identity, id)?;
        check_active(&entry, Utc::now())?;

        let _guard = entry.lock().await;
        let now = Utc::now();
        check_active(&entry, now)?;

        let expires_at = entry.update(|s| {
            s.expires_at = s.extended_expiry(delta_seconds);
            s.last_activity_at = now;
            s.expires_at
        });
        self.persist(&entry).await;

        info!(session_id = entry.id(), %expires_at, "session extended");
        Ok(expires_at)
    }

    /// Tear a session down. Stopping an ended session succeeds without
    /// touching the runtime; one left provisioning by an interrupted start
    /// is failed.
    pub async fn stop(&self, identity: &str, id: &str) -> SessionResult<()> {
        let entry = self.lookup(identity, id)?;
        if entry.state().is_terminal() {
            return Ok(());
        }

        let _guard = entry.lock().await;
        if entry.state().is_live() {
            info!(
                session_id = entry.id(),
                owner = identity,
                state = %entry.state(),
                "stopping session"
            );
            self.finish(&entry).await;
        }
        Ok(())
    }

    /// [`Self::start`] on its own task, so a caller that goes away cannot
    /// cut provisioning short.
    pub async fn start_detached(self: &Arc<Self>, identity: &str) -> SessionResult<StartOutcome> {
        let service = Arc::clone(self);
        let identity = identity.to_string();
        detached(async move { service.start(&identity).await }).await
    }

    /// [`Self::stop`] on its own task, so a caller that goes away cannot
    /// leave a teardown half done.
    pub async fn stop_detached(self: &Arc<Self>, identity: &str, id: &str) -> SessionResult<()> {
        let service = Arc::clone(self);
        let identity = identity.to_string();
        let id = id.to_string();
        detached(async move { service.stop(&identity, &id).await }).await
    }

    /// Snapshot of a session; takes no execution lock.
    pub fn status(&self, identity: &str, id: &str) -> SessionResult<SessionView> {
        let entry = self.lookup(identity, id)?;
        Ok(entry.with(|s| s.view(Utc::now())))
    }

    /// Stop every live session. Used on shutdown.
    pub async fn drain(&self) -> usize {
        let live: Vec<_> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.state().is_live())
            .collect();
        if live.is_empty() {
            return 0;
        }
        info!("draining {} live session(s)", live.len());

        stream::iter(live)
            .map(|entry| async move {
                let _guard = entry.lock().await;
                usize::from(self.finish(&entry).await)
            })
            .buffer_unordered(self.reaper.concurrency)
            .fold(0, |total, n| async move { total + n })
            .await
    }

    pub fn stats(&self) -> ServiceStats {
        let by_state = self
            .registry
            .counts_by_state()
            .into_iter()
            .map(|(state, count)| (state.to_string(), count))
            .collect();
        ServiceStats {
            sessions: self.registry.len(),
            active: self.limiter.active_total(),
            capacity: self.limiter.policy().max_active_global,
            by_state,
        }
    }

    // ========================================================================
    // Reaper steps
    // ========================================================================

    /// One full reaper pass at time `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            expired: self.expire_due(now).await,
            abandoned: self.recover_abandoned().await,
            missing: self.reconcile_missing(now).await,
            destroyed: self.retry_pending_destroys(now).await,
            orphans: self.collect_orphans().await,
            purged: self.purge_tombstones(now).await,
            pruned: self.limiter.prune(),
        };
        if !report.is_empty() {
            info!(
                expired = report.expired,
                abandoned = report.abandoned,
                missing = report.missing,
                destroyed = report.destroyed,
                orphans = report.orphans,
                purged = report.purged,
                "reaper sweep"
            );
        }
        report
    }

    /// Tear down running sessions whose deadline passed.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> usize {
        let due: Vec<_> = self
            .registry
            .entries()
            .into_iter()
            .filter(|e| e.with(|s| s.state == SessionState::Running && s.is_expired(now)))
            .collect();

        stream::iter(due)
            .map(|entry| self.expire_one(entry, now))
            .buffer_unordered(self.reaper.concurrency)
            .filter(|expired| futures::future::ready(*expired))
            .count()
            .await
    }

    async fn expire_one(&self, entry: Arc<SessionEntry>, now: DateTime<Utc>) -> bool {
        let _guard = entry.lock().await;

        // An extend or stop may have won the lock first.
        if !entry.with(|s| s.state == SessionState::Running && s.is_expired(now)) {
            return false;
        }
        if let Err(e) = entry.transition(SessionState::Expiring, now) {
            warn!(session_id = entry.id(), "cannot expire session: {}", e);
            return false;
        }
        self.persist(&entry).await;

        info!(session_id = entry.id(), owner = entry.owner(), "session expired");
        self.teardown(&entry).await;
        true
    }

    /// Finish sessions left mid-transition by a task that went away. Nobody
    /// holds the execution lock of such a session; a provisioning one fails
    /// and an expiring or stopping one is torn down.
    pub async fn recover_abandoned(&self) -> usize {
        let mut count = 0;

        for entry in self.registry.entries() {
            if !is_transitional(entry.state()) {
                continue;
            }
            let Some(_guard) = entry.try_lock() else {
                continue;
            };
            if !is_transitional(entry.state()) {
                continue;
            }

            warn!(
                session_id = entry.id(),
                state = %entry.state(),
                "recovering abandoned session"
            );
            if self.finish(&entry).await {
                count += 1;
            }
        }

        count
    }

    /// Settle live sessions whose instance vanished (destroyed) or stopped
    /// running (failed). Busy sessions are skipped until the next sweep.
    pub async fn reconcile_missing(&self, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        let timeout = self.lifecycle.runtime_call_timeout();

        for entry in self.registry.entries() {
            if !is_running_like(entry.state()) {
                continue;
            }
            let Some(_guard) = entry.try_lock() else {
                continue;
            };
            if !is_running_like(entry.state()) {
                continue;
            }
            let Some(handle) = entry.handle() else {
                continue;
            };

            match tokio::time::timeout(timeout, self.runtime.inspect(&handle)).await {
                Ok(Ok(InstanceState::Missing)) => {
                    warn!(session_id = entry.id(), handle = %handle, "instance disappeared");
                    entry.update(|s| {
                        s.runtime_handle = None;
                        s.error_message = Some("instance disappeared".to_string());
                    });
                    if entry.transition(SessionState::Destroyed, now).is_ok() {
                        count += 1;
                    }
                    self.persist(&entry).await;
                }
                Ok(Ok(InstanceState::Running)) => {}
                Ok(Ok(state)) => {
                    warn!(
                        session_id = entry.id(),
                        handle = %handle,
                        ?state,
                        "instance is no longer running"
                    );
                    self.fail(&entry, &format!("instance stopped running: {state:?}"))
                        .await;
                    count += 1;
                }
                Ok(Err(e)) => debug!(session_id = entry.id(), "inspect failed: {}", e),
                Err(_) => debug!(session_id = entry.id(), "inspect timed out"),
            }
        }

        count
    }

    /// Retry removing instances of ended sessions whose destroy failed earlier.
    pub async fn retry_pending_destroys(&self, now: DateTime<Utc>) -> usize {
        let mut count = 0;

        for entry in self.registry.entries() {
            if !entry.with(|s| s.state.is_terminal() && s.runtime_handle.is_some()) {
                continue;
            }
            let Some(_guard) = entry.try_lock() else {
                continue;
            };
            let Some(handle) = entry.handle() else {
                continue;
            };

            if self.destroy_instance(&handle).await {
                entry.update(|s| s.runtime_handle = None);
                if entry.state() != SessionState::Destroyed {
                    let _ = entry.transition(SessionState::Destroyed, now);
                }
                self.persist(&entry).await;
                count += 1;
            }
        }

        count
    }

    /// Remove managed instances no live session accounts for, such as one
    /// whose create call returned after its session had already failed.
    pub async fn collect_orphans(&self) -> usize {
        let Some(listed) = self.list_managed_quietly().await else {
            return 0;
        };
        let tracked: HashSet<InstanceHandle> = self
            .registry
            .entries()
            .iter()
            .filter_map(|entry| entry.handle())
            .collect();

        let mut count = 0;
        for instance in listed {
            if tracked.contains(&instance.handle) {
                continue;
            }
            let owned = instance
                .session_id
                .as_deref()
                .and_then(|id| self.registry.get(id))
                .is_some_and(|entry| entry.state().is_live());
            if owned {
                continue;
            }

            info!(
                handle = %instance.handle,
                session_id = instance.session_id.as_deref().unwrap_or("-"),
                "destroying orphan instance"
            );
            if self.destroy_instance(&instance.handle).await {
                count += 1;
            }
        }

        count
    }

    /// Forget ended sessions older than the tombstone retention.
    pub async fn purge_tombstones(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.reaper.tombstone_ttl();
        let mut count = 0;

        for entry in self.registry.entries() {
            let stale = entry.with(|s| {
                s.state.is_terminal()
                    && s.runtime_handle.is_none()
                    && s.ended_at.is_some_and(|ended| ended + ttl <= now)
            });
            if !stale {
                continue;
            }
            self.registry.remove(entry.id());
            if let Err(e) = self.store.delete(entry.id()).await {
                warn!(session_id = entry.id(), "failed to delete checkpoint: {:#}", e);
            }
            count += 1;
        }

        count
    }

    /// Bring the registry and the runtime back in line after a restart.
    ///
    /// Checkpointed sessions whose instance still runs and whose deadline has
    /// not passed are restored; every other managed instance is destroyed.
    pub async fn reconcile_on_startup(&self) -> SessionResult<ReconcileReport> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let checkpointed = match self.store.load_all().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("failed to load session checkpoints: {:#}", e);
                Vec::new()
            }
        };

        let listed = self
            .call_with_retry("list", || self.runtime.list_managed())
            .await?;
        let mut instances: HashMap<InstanceHandle, ManagedInstance> = listed
            .into_iter()
            .map(|instance| (instance.handle.clone(), instance))
            .collect();

        // Instances of sessions this process already tracks are not orphans.
        for entry in self.registry.entries() {
            if let Some(handle) = entry.handle() {
                instances.remove(&handle);
            }
        }

        for session in checkpointed {
            if self.registry.get(&session.id).is_some() {
                continue;
            }

            let instance = session
                .runtime_handle
                .as_ref()
                .and_then(|handle| instances.remove(handle));
            let restorable = session.state == SessionState::Running
                && !session.is_expired(now)
                && instance
                    .as_ref()
                    .is_some_and(|i| i.state == InstanceState::Running);

            let slot = if restorable {
                self.limiter.admit_restored(&session.owner)
            } else {
                None
            };
            if let Some(slot) = slot {
                info!(session_id = %session.id, owner = %session.owner, "restored session");
                self.registry
                    .insert(Arc::new(SessionEntry::new(session, slot)));
                report.restored += 1;
                continue;
            }

            if let Some(instance) = instance {
                if !self.destroy_instance(&instance.handle).await {
                    report.failed += 1;
                }
            }
            if session.state.is_live() {
                info!(session_id = %session.id, state = %session.state, "dropping stale session");
                report.sessions_destroyed += 1;
            }
            if let Err(e) = self.store.delete(&session.id).await {
                warn!(session_id = %session.id, "failed to delete checkpoint: {:#}", e);
            }
        }

        for (handle, instance) in instances {
            info!(
                handle = %handle,
                session_id = instance.session_id.as_deref().unwrap_or("-"),
                "destroying orphan instance"
            );
            if self.destroy_instance(&handle).await {
                report.orphans_destroyed += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            restored = report.restored,
            sessions_destroyed = report.sessions_destroyed,
            orphans_destroyed = report.orphans_destroyed,
            failed = report.failed,
            "startup reconciliation finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lookup(&self, identity: &str, id: &str) -> SessionResult<Arc<SessionEntry>> {
        self.registry
            .get_owned(id, identity)
            .ok_or(SessionError::NotFound)
    }

    /// Create and start the instance. Caller holds the execution lock.
    async fn provision(&self, entry: &SessionEntry) -> SessionResult<()> {
        let limits = entry.with(|s| s.limits.clone());
        let spec = InstanceSpec::for_session(&self.name_prefix, entry.id(), limits);

        let handle = self
            .call_with_retry("create", || self.runtime.create(&spec))
            .await?;
        entry.update(|s| s.runtime_handle = Some(handle.clone()));
        self.persist(entry).await;

        self.call_with_retry("start", || self.runtime.start(&handle))
            .await?;

        let now = Utc::now();
        entry.update(|s| {
            s.expires_at = s.initial_expiry(now);
            s.last_activity_at = now;
        });
        entry.transition(SessionState::Running, now)
    }

    /// Drive a live session to its end. Caller holds the execution lock, so
    /// a session still requested or provisioning lost the start that owned it.
    /// Returns false if the session had already ended.
    async fn finish(&self, entry: &SessionEntry) -> bool {
        match entry.state() {
            state if state.is_terminal() => false,
            SessionState::Requested | SessionState::Provisioning => {
                self.fail(entry, "provisioning abandoned").await;
                true
            }
            _ => {
                self.teardown(entry).await;
                true
            }
        }
    }

    /// Record a failure and remove whatever was created.
    async fn fail(&self, entry: &SessionEntry, reason: &str) {
        entry.update(|s| s.error_message = Some(reason.to_string()));
        if let Err(e) = entry.transition(SessionState::Failed, Utc::now()) {
            warn!(session_id = entry.id(), "cannot mark session failed: {}", e);
        }

        if let Some(handle) = entry.handle() {
            if self.destroy_instance(&handle).await {
                entry.update(|s| s.runtime_handle = None);
                let _ = entry.transition(SessionState::Destroyed, Utc::now());
            }
        }
        self.remove_strays(entry).await;
        self.persist(entry).await;
    }

    /// Remove instances labelled with this session that it never recorded,
    /// e.g. from a create call that timed out after the runtime made the
    /// instance.
    async fn remove_strays(&self, entry: &SessionEntry) {
        let Some(listed) = self.list_managed_quietly().await else {
            return;
        };
        let known = entry.handle();

        for instance in listed {
            if instance.session_id.as_deref() != Some(entry.id())
                || known.as_ref() == Some(&instance.handle)
            {
                continue;
            }
            info!(session_id = entry.id(), handle = %instance.handle, "removing stray instance");
            self.destroy_instance(&instance.handle).await;
        }
    }

    /// `list_managed` under the call timeout; failures are logged and skipped.
    async fn list_managed_quietly(&self) -> Option<Vec<ManagedInstance>> {
        let timeout = self.lifecycle.runtime_call_timeout();
        match tokio::time::timeout(timeout, self.runtime.list_managed()).await {
            Ok(Ok(listed)) => Some(listed),
            Ok(Err(e)) => {
                debug!("listing managed instances failed: {}", e);
                None
            }
            Err(_) => {
                debug!("listing managed instances timed out");
                None
            }
        }
    }

    /// Whether the runtime still reports the instance as running. An
    /// inconclusive answer counts as running.
    async fn instance_running(&self, handle: &InstanceHandle) -> bool {
        let timeout = self.lifecycle.runtime_call_timeout();
        match tokio::time::timeout(timeout, self.runtime.inspect(handle)).await {
            Ok(Ok(state)) => state == InstanceState::Running,
            Ok(Err(e)) => {
                debug!(handle = %handle, "inspect failed: {}", e);
                true
            }
            Err(_) => true,
        }
    }

    /// Stop and remove the instance, ending in `destroyed`, or in `stopped`
    /// with the handle kept when removal failed (retried by the reaper).
    /// Caller holds the execution lock.
    async fn teardown(&self, entry: &SessionEntry) {
        if entry.state() != SessionState::Stopping {
            if let Err(e) = entry.transition(SessionState::Stopping, Utc::now()) {
                warn!(session_id = entry.id(), "cannot stop session: {}", e);
                return;
            }
            self.persist(entry).await;
        }

        match entry.handle() {
            Some(handle) => {
                if let Err(e) = self
                    .call_with_retry("stop", || self.runtime.stop(&handle))
                    .await
                {
                    if !e.is_not_found() {
                        warn!(session_id = entry.id(), "stop failed, removing anyway: {}", e);
                    }
                }

                let removed = self.destroy_instance(&handle).await;
                let _ = entry.transition(SessionState::Stopped, Utc::now());
                if removed {
                    entry.update(|s| s.runtime_handle = None);
                    let _ = entry.transition(SessionState::Destroyed, Utc::now());
                } else {
                    entry.update(|s| s.error_message = Some("instance removal pending".to_string()));
                }
            }
            None => {
                let _ = entry.transition(SessionState::Stopped, Utc::now());
                let _ = entry.transition(SessionState::Destroyed, Utc::now());
            }
        }

        self.persist(entry).await;
        debug!(session_id = entry.id(), state = %entry.state(), "teardown finished");
    }

    /// Remove an instance; an instance that is already gone counts as removed.
    async fn destroy_instance(&self, handle: &InstanceHandle) -> bool {
        match self
            .call_with_retry("destroy", || self.runtime.destroy(handle))
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!(handle = %handle, "destroy failed: {}", e);
                false
            }
        }
    }

    /// Run a runtime call with the call timeout, retrying transient failures
    /// with exponential backoff.
    async fn call_with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> RuntimeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let timeout = self.lifecycle.runtime_call_timeout();
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(RuntimeError::Timeout {
                    operation: operation.to_string(),
                    after: timeout,
                }),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.lifecycle.retry_max_attempts => {
                    let delay = self.lifecycle.backoff(attempt);
                    warn!(
                        operation,
                        attempt, "transient runtime failure, retrying in {:?}: {}", delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn persist(&self, entry: &SessionEntry) {
        if let Err(e) = self.store.save(&entry.snapshot()).await {
            warn!(session_id = entry.id(), "failed to checkpoint session: {:#}", e);
        }
    }
}

fn is_running_like(state: SessionState) -> bool {
    matches!(state, SessionState::Running | SessionState::Expiring)
}

/// States a session only holds while some task is working on it.
fn is_transitional(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::Requested
            | SessionState::Provisioning
            | SessionState::Expiring
            | SessionState::Stopping
    )
}

/// Run session work on its own task and wait for it.
async fn detached<T, F>(work: F) -> SessionResult<T>
where
    T: Send + 'static,
    F: Future<Output = SessionResult<T>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| SessionError::Internal(format!("session task failed: {e}")))?
}

/// Execute and extend need a running session inside its deadline.
fn check_active(entry: &SessionEntry, now: DateTime<Utc>) -> SessionResult<()> {
    entry.with(|s| match s.state {
        SessionState::Running if !s.is_expired(now) => Ok(()),
        SessionState::Requested | SessionState::Provisioning => Err(SessionError::InvalidState(
            "session is still provisioning".to_string(),
        )),
        _ => Err(SessionError::Gone(s.id.clone())),
    })
}

fn running_handle(entry: &SessionEntry) -> SessionResult<InstanceHandle> {
    entry
        .handle()
        .ok_or_else(|| SessionError::Internal("running session has no instance".to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::runtime::{ExecOutput, ExecRequest};
    use crate::session::store::NoopSessionStore;

    /// Runtime that fails `create` with a transient error a set number of times.
    #[derive(Default)]
    struct FlakyRuntime {
        create_failures: AtomicUsize,
        creates: AtomicUsize,
        destroyed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RuntimeAdapter for FlakyRuntime {
        async fn create(&self, spec: &InstanceSpec) -> RuntimeResult<InstanceHandle> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let remaining = self.create_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.create_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RuntimeError::CommandFailed {
                    command: "create".to_string(),
                    message: "Cannot connect to the Docker daemon".to_string(),
                });
            }
            Ok(InstanceHandle::new(spec.name.clone()))
        }

        async fn start(&self, _: &InstanceHandle) -> RuntimeResult<()> {
            Ok(())
        }

        async fn exec(&self, _: &InstanceHandle, _: &ExecRequest) -> RuntimeResult<ExecOutput> {
            Ok(ExecOutput::default())
        }

        async fn stop(&self, _: &InstanceHandle) -> RuntimeResult<()> {
            Ok(())
        }

        async fn destroy(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
            self.destroyed.lock().unwrap().push(handle.to_string());
            Ok(())
        }

        async fn inspect(&self, _: &InstanceHandle) -> RuntimeResult<InstanceState> {
            Ok(InstanceState::Running)
        }

        async fn list_managed(&self) -> RuntimeResult<Vec<ManagedInstance>> {
            Ok(Vec::new())
        }

        async fn health_check(&self) -> RuntimeResult<String> {
            Ok("flaky".to_string())
        }
    }

    fn service(runtime: Arc<FlakyRuntime>) -> SessionService {
        let mut config = AppConfig::default();
        config.lifecycle.retry_base_delay_ms = 1;
        config.lifecycle.retry_max_delay_ms = 2;
        SessionService::new(&config, runtime, Arc::new(NoopSessionStore))
    }

    #[tokio::test]
    async fn test_transient_create_failure_is_retried() {
        let runtime = Arc::new(FlakyRuntime {
            create_failures: AtomicUsize::new(2),
            ..Default::default()
        });
        let service = service(Arc::clone(&runtime));

        let outcome = service.start("10.0.0.1").await.unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.session.state, SessionState::Running);
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded_and_release_quota() {
        let runtime = Arc::new(FlakyRuntime {
            create_failures: AtomicUsize::new(10),
            ..Default::default()
        });
        let service = service(Arc::clone(&runtime));

        let err = service.start("10.0.0.1").await.unwrap_err();
        assert!(matches!(err, SessionError::RuntimeTransient(_)));
        assert_eq!(runtime.creates.load(Ordering::SeqCst), 3);
        assert_eq!(service.limiter().active_total(), 0);

        let entry = service.registry().entries().pop().unwrap();
        assert_eq!(entry.state(), SessionState::Failed);
        assert!(entry.snapshot().error_message.is_some());
    }

    #[tokio::test]
    async fn test_reuse_and_reject_policies() {
        let runtime = Arc::new(FlakyRuntime::default());
        let service = service(Arc::clone(&runtime));

        let first = service.start("10.0.0.1").await.unwrap();
        let again = service.start("10.0.0.1").await.unwrap();
        assert!(again.reused);
        assert_eq!(again.session.session_id, first.session.session_id);

        let mut config = AppConfig::default();
        config.quota.existing_session = ExistingSessionPolicy::Reject;
        let strict = SessionService::new(&config, runtime, Arc::new(NoopSessionStore));
        strict.start("10.0.0.1").await.unwrap();
        assert!(matches!(
            strict.start("10.0.0.1").await.unwrap_err(),
            SessionError::AlreadyActive(_)
        ));
    }

    #[tokio::test]
    async fn test_extend_validates_delta() {
        let service = service(Arc::new(FlakyRuntime::default()));
        let outcome = service.start("10.0.0.1").await.unwrap();
        let id = outcome.session.session_id;

        assert!(matches!(
            service.extend("10.0.0.1", &id, 0).await.unwrap_err(),
            SessionError::BadRequest(_)
        ));
        let extended = service.extend("10.0.0.1", &id, 60).await.unwrap();
        assert!(extended > outcome.session.expires_at);
    }

    #[tokio::test]
    async fn test_stats_track_active_sessions() {
        let service = service(Arc::new(FlakyRuntime::default()));
        let outcome = service.start("10.0.0.1").await.unwrap();
        service.start("10.0.0.2").await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.by_state.get("running"), Some(&2));

        service
            .stop("10.0.0.1", &outcome.session.session_id)
            .await
            .unwrap();
        let stats = service.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_state.get("destroyed"), Some(&1));
    }

    #[tokio::test]
    async fn test_drain_stops_everything() {
        let runtime = Arc::new(FlakyRuntime::default());
        let service = service(Arc::clone(&runtime));
        for i in 0..3 {
            service.start(&format!("10.0.0.{i}")).await.unwrap();
        }

        assert_eq!(service.drain().await, 3);
        assert_eq!(service.limiter().active_total(), 0);
        assert_eq!(runtime.destroyed.lock().unwrap().len(), 3);
        assert_eq!(service.drain().await, 0);
    }
}
