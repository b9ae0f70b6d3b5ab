//! Test utilities and common setup.
#![allow(clippy::field_reassign_with_default, dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, Response, header};
use serde_json::Value;
use tower::ServiceExt;

use sandboxvm::api::{self, AppState};
use sandboxvm::config::AppConfig;
use sandboxvm::runtime::{
    ExecOutput, ExecRequest, InstanceHandle, InstanceSpec, InstanceState, ManagedInstance,
    RuntimeAdapter, RuntimeError, RuntimeResult,
};
use sandboxvm::session::{NoopSessionStore, SessionService, SessionStore};

#[derive(Debug, Clone)]
struct FakeInstance {
    session_id: Option<String>,
    state: InstanceState,
}

/// In-memory runtime that records how it is called.
#[derive(Default)]
pub struct FakeRuntime {
    instances: Mutex<HashMap<String, FakeInstance>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: AtomicUsize,
    create_delay: Mutex<Duration>,
    start_delay: Mutex<Duration>,
    stop_delay: Mutex<Duration>,
    exec_delay: Mutex<Duration>,
    exec_times_out: Mutex<bool>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub stops: AtomicUsize,
    pub destroys: AtomicUsize,
    pub execs: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every create register its instance, then take `delay` to return.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock().unwrap() = delay;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    /// Make every exec take `delay`.
    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    /// Make every exec report that it was killed by its timeout.
    pub fn set_exec_times_out(&self, times_out: bool) {
        *self.exec_times_out.lock().unwrap() = times_out;
    }

    /// Add a managed instance nobody asked for.
    pub fn inject_orphan(&self, handle: &str, session_id: Option<&str>) {
        self.instances.lock().unwrap().insert(
            handle.to_string(),
            FakeInstance {
                session_id: session_id.map(str::to_string),
                state: InstanceState::Running,
            },
        );
    }

    /// Remove an instance behind the service's back.
    pub fn vanish(&self, handle: &str) {
        self.instances.lock().unwrap().remove(handle);
    }

    /// Let an instance exit behind the service's back, as an OOM kill would.
    pub fn exit(&self, handle: &str) {
        self.set_state(&InstanceHandle::new(handle), InstanceState::Stopped);
    }

    pub fn exists(&self, handle: &str) -> bool {
        self.instances.lock().unwrap().contains_key(handle)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Highest number of calls ever observed in flight on one handle.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn enter(&self, handle: &InstanceHandle) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(handle.to_string()).or_insert(0);
        *count += 1;
        self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
    }

    fn leave(&self, handle: &InstanceHandle) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(handle.as_str()) {
            *count -= 1;
        }
    }

    fn require(&self, handle: &InstanceHandle) -> RuntimeResult<InstanceState> {
        self.instances
            .lock()
            .unwrap()
            .get(handle.as_str())
            .map(|i| i.state.clone())
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    fn set_state(&self, handle: &InstanceHandle, state: InstanceState) {
        if let Some(instance) = self.instances.lock().unwrap().get_mut(handle.as_str()) {
            instance.state = state;
        }
    }
}

#[async_trait]
impl RuntimeAdapter for FakeRuntime {
    async fn create(&self, spec: &InstanceSpec) -> RuntimeResult<InstanceHandle> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.instances.lock().unwrap().insert(
            id.clone(),
            FakeInstance {
                session_id: Some(spec.session_id.clone()),
                state: InstanceState::Created,
            },
        );
        pause(&self.create_delay).await;
        Ok(InstanceHandle::new(id))
    }

    async fn start(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        pause(&self.start_delay).await;
        self.enter(handle);
        let result = self.require(handle);
        if result.is_ok() {
            self.set_state(handle, InstanceState::Running);
        }
        self.leave(handle);
        result.map(|_| ())
    }

    async fn exec(&self, handle: &InstanceHandle, request: &ExecRequest) -> RuntimeResult<ExecOutput> {
        self.enter(handle);
        self.execs.fetch_add(1, Ordering::SeqCst);

        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match self.require(handle) {
            Ok(InstanceState::Running) => {
                if *self.exec_times_out.lock().unwrap() {
                    Ok(ExecOutput {
                        stdout: b"partial".to_vec(),
                        timed_out: true,
                        ..Default::default()
                    })
                } else {
                    Ok(fake_shell(&request.command, request.max_output_bytes))
                }
            }
            Ok(_) => Err(RuntimeError::NotRunning(handle.to_string())),
            Err(e) => Err(e),
        };

        self.leave(handle);
        result
    }

    async fn stop(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        pause(&self.stop_delay).await;
        self.enter(handle);
        let result = self.require(handle);
        if result.is_ok() {
            self.set_state(handle, InstanceState::Stopped);
        }
        self.leave(handle);
        result.map(|_| ())
    }

    async fn destroy(&self, handle: &InstanceHandle) -> RuntimeResult<()> {
        self.enter(handle);
        self.destroys.fetch_add(1, Ordering::SeqCst);
        let removed = self.instances.lock().unwrap().remove(handle.as_str());
        self.leave(handle);
        removed
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(handle.to_string()))
    }

    async fn inspect(&self, handle: &InstanceHandle) -> RuntimeResult<InstanceState> {
        Ok(self.require(handle).unwrap_or(InstanceState::Missing))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedInstance>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(id, instance)| ManagedInstance {
                handle: InstanceHandle::new(id.clone()),
                session_id: instance.session_id.clone(),
                state: instance.state.clone(),
            })
            .collect())
    }

    async fn health_check(&self) -> RuntimeResult<String> {
        Ok("fake".to_string())
    }
}

async fn pause(delay: &Mutex<Duration>) {
    let delay = *delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Just enough of a shell for `echo`.
fn fake_shell(command: &str, max_output_bytes: usize) -> ExecOutput {
    match command.strip_prefix("echo ") {
        Some(text) => {
            let mut stdout = format!("{text}\n").into_bytes();
            let truncated = stdout.len() > max_output_bytes;
            stdout.truncate(max_output_bytes);
            ExecOutput {
                stdout,
                exit_code: Some(0),
                truncated,
                ..Default::default()
            }
        }
        None => ExecOutput {
            stderr: b"sh: command not found\n".to_vec(),
            exit_code: Some(127),
            ..Default::default()
        },
    }
}

/// Config with retries fast enough for tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.lifecycle.retry_base_delay_ms = 1;
    config.lifecycle.retry_max_delay_ms = 2;
    config.quota.max_starts_per_window = 100;
    config
}

pub fn test_service(config: &AppConfig, runtime: Arc<FakeRuntime>) -> Arc<SessionService> {
    test_service_with_store(config, runtime, Arc::new(NoopSessionStore))
}

pub fn test_service_with_store(
    config: &AppConfig,
    runtime: Arc<FakeRuntime>,
    store: Arc<dyn SessionStore>,
) -> Arc<SessionService> {
    Arc::new(SessionService::new(config, runtime, store))
}

/// Create a test application backed by a fake runtime.
pub fn test_app(config: &AppConfig) -> (Router, Arc<SessionService>, Arc<FakeRuntime>) {
    let runtime = FakeRuntime::new();
    let service = test_service(config, Arc::clone(&runtime));
    let state = AppState::new(Arc::clone(&service))
        .with_trust_forwarded_for(config.server.trust_forwarded_for);
    (api::create_router(state), service, runtime)
}

/// Send one request from `peer`, returning the status and decoded JSON body.
pub async fn send(
    app: &Router,
    peer: &str,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (Response<Body>, Value) {
    send_with_headers(app, peer, method, uri, body, &[]).await
}

pub async fn send_with_headers(
    app: &Router,
    peer: &str,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (Response<Body>, Value) {
    let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
    let mut builder = Request::builder()
        .uri(uri)
        .method(method)
        .extension(ConnectInfo(addr));
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&json).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (Response::from_parts(parts, Body::empty()), json)
}
