//! Service configuration.
//!
//! Layering: built-in defaults, then the TOML file, then `SANDBOXVM__*`
//! environment variables (`__` separates nested keys, e.g.
//! `SANDBOXVM__QUOTA__MAX_ACTIVE_GLOBAL=8`).

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::limits::{MAX_TTL_SECONDS, ResourceLimits, ttl_duration};
use crate::runtime::{BackendKind, RuntimeType, validate_image_name};
use crate::session::QuotaPolicy;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Default prefix of instance names created by this service.
pub const DEFAULT_NAME_PREFIX: &str = "sandboxvm";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub runtime: RuntimeConfig,
    pub limits: ResourceLimits,
    pub quota: QuotaPolicy,
    pub lifecycle: LifecycleConfig,
    pub reaper: ReaperConfig,
    pub checkpoint: CheckpointConfig,
}

impl AppConfig {
    /// Reject values that would make the service misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate().map_err(|e| anyhow!(e))?;
        self.quota.validate().map_err(|e| anyhow!(e))?;

        if self.server.host.trim().is_empty() {
            bail!("server.host cannot be empty");
        }
        if self.lifecycle.runtime_call_timeout_seconds == 0 {
            bail!("lifecycle.runtime_call_timeout_seconds must be greater than zero");
        }
        if self.lifecycle.retry_max_attempts == 0 {
            bail!("lifecycle.retry_max_attempts must be at least 1");
        }
        if self.lifecycle.retry_base_delay_ms > self.lifecycle.retry_max_delay_ms {
            bail!("lifecycle.retry_base_delay_ms cannot exceed lifecycle.retry_max_delay_ms");
        }
        if self.reaper.interval_seconds == 0 {
            bail!("reaper.interval_seconds must be greater than zero");
        }
        if self.reaper.tombstone_ttl_seconds > MAX_TTL_SECONDS {
            bail!("reaper.tombstone_ttl_seconds cannot exceed {} (one year)", MAX_TTL_SECONDS);
        }
        if self.reaper.concurrency == 0 {
            bail!("reaper.concurrency must be greater than zero");
        }
        if self.runtime.backend == BackendKind::Container {
            validate_image_name(&self.runtime.container.image)
                .map_err(|e| anyhow!("runtime.container.image: {}", e))?;
        }
        crate::runtime::validate_name_prefix(&self.runtime.name_prefix)
            .map_err(|e| anyhow!("runtime.name_prefix: {}", e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Take the caller identity from `X-Forwarded-For` (only behind a trusted proxy).
    pub trust_forwarded_for: bool,
    /// Stop every live session before exiting.
    pub drain_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
            trust_forwarded_for: false,
            drain_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which backend provisions instances.
    pub backend: BackendKind,
    /// Instance names are `<name_prefix>-<session suffix>`.
    pub name_prefix: String,
    pub container: ContainerSettings,
    pub local: LocalSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Container,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            container: ContainerSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    pub runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    pub binary: Option<String>,
    /// Image every sandbox is created from
    pub image: String,
    /// Value passed to `--network`
    pub network_mode: String,
    /// Writable tmpfs working directory inside the read-only rootfs
    pub workdir: String,
    /// Pass `--storage-opt size=` (needs overlay on xfs with pquota)
    pub enforce_disk_quota: bool,
    /// Grace period given to `stop` before the runtime kills the container
    pub stop_timeout_seconds: u32,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "alpine:3.20".to_string(),
            network_mode: "none".to_string(),
            workdir: "/workspace".to_string(),
            enforce_disk_quota: false,
            stop_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Directory holding one subdirectory per instance.
    pub base_dir: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            base_dir: format!("~/.local/state/{}/instances", APP_NAME),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on a single create/start/stop/destroy call.
    pub runtime_call_timeout_seconds: u64,
    /// Attempts for transient runtime failures (first try included).
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            runtime_call_timeout_seconds: 30,
            retry_max_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 2_000,
        }
    }
}

impl LifecycleConfig {
    pub fn runtime_call_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_call_timeout_seconds)
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Seconds between sweeps.
    pub interval_seconds: u64,
    /// How long terminal sessions stay queryable.
    pub tombstone_ttl_seconds: u64,
    /// Expired sessions torn down in parallel per sweep.
    pub concurrency: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            tombstone_ttl_seconds: 300,
            concurrency: 4,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn tombstone_ttl(&self) -> chrono::Duration {
        ttl_duration(self.tombstone_ttl_seconds)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Persist sessions to SQLite so a restart can reconcile them.
    pub enabled: bool,
    /// Database path; defaults to `<state dir>/sessions.db`.
    pub path: Option<String>,
}

// ============================================================================
// Paths and loading
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub state_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            state_dir: default_state_dir()?,
        })
    }

    /// Where the checkpoint database lives for this config.
    pub fn checkpoint_path(&self, cfg: &AppConfig) -> Result<PathBuf> {
        match cfg.checkpoint.path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.state_dir.join("sessions.db")),
        }
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, state: {}",
            self.config_file.display(),
            self.state_dir.display()
        )
    }
}

/// Load the layered configuration, writing a default file on first run.
pub fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let built = Config::builder()
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix().as_str())
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("building configuration")?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("parsing configuration")?;

    config.runtime.local.base_dir = expand_str_path(&config.runtime.local.base_dir)?
        .display()
        .to_string();

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Every key can be overridden with ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__SECTION__KEY\n\n");
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
