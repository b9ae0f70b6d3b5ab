//! Per-session resource limit policy.
//!
//! A [`ResourceLimits`] value is loaded from the `[limits]` config table and
//! copied into every session at creation time, so later config changes never
//! alter the quotas of sessions that are already running.

use serde::{Deserialize, Serialize};

/// Default session lifetime when no extension is requested.
const DEFAULT_TTL_SECONDS: u64 = 10 * 60;

/// Upper bound on a session's lifetime, extensions included.
const DEFAULT_MAX_TOTAL_TTL_SECONDS: u64 = 60 * 60;

/// Longest lifetime any TTL setting may ask for (one year).
pub const MAX_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Wall-clock budget for a single command.
const DEFAULT_EXEC_TIMEOUT_SECONDS: u64 = 30;

/// Captured bytes per output stream.
const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Maximum accepted command length.
const DEFAULT_MAX_COMMAND_BYTES: usize = 8 * 1024;

/// Resource quotas applied to one sandbox session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU share, in cores (`--cpus`).
    pub cpu_cores: f64,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
    /// Writable disk in MiB. Only enforced when the backend supports it.
    pub disk_mb: u64,
    /// Maximum number of processes inside the instance.
    pub pids_limit: u32,
    /// Lifetime granted on start.
    pub default_ttl_seconds: u64,
    /// Hard cap on `expires_at - created_at`.
    pub max_total_ttl_seconds: u64,
    /// Per-command wall-clock timeout.
    pub exec_timeout_seconds: u64,
    /// Captured output per stream; the rest is discarded.
    pub max_output_bytes: usize,
    /// Longest accepted command string.
    pub max_command_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_cores: 0.5,
            memory_mb: 256,
            disk_mb: 512,
            pids_limit: 128,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            max_total_ttl_seconds: DEFAULT_MAX_TOTAL_TTL_SECONDS,
            exec_timeout_seconds: DEFAULT_EXEC_TIMEOUT_SECONDS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_command_bytes: DEFAULT_MAX_COMMAND_BYTES,
        }
    }
}

impl ResourceLimits {
    /// Check that the policy is internally consistent.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.cpu_cores.is_finite() && self.cpu_cores > 0.0) {
            return Err("limits.cpu_cores must be a positive number".to_string());
        }
        if self.memory_mb == 0 {
            return Err("limits.memory_mb must be greater than zero".to_string());
        }
        if self.pids_limit == 0 {
            return Err("limits.pids_limit must be greater than zero".to_string());
        }
        if self.default_ttl_seconds == 0 {
            return Err("limits.default_ttl_seconds must be greater than zero".to_string());
        }
        if self.max_total_ttl_seconds > MAX_TTL_SECONDS {
            return Err(format!(
                "limits.max_total_ttl_seconds cannot exceed {} (one year)",
                MAX_TTL_SECONDS
            ));
        }
        if self.default_ttl_seconds > self.max_total_ttl_seconds {
            return Err(format!(
                "limits.default_ttl_seconds ({}) cannot exceed limits.max_total_ttl_seconds ({})",
                self.default_ttl_seconds, self.max_total_ttl_seconds
            ));
        }
        if self.exec_timeout_seconds == 0 {
            return Err("limits.exec_timeout_seconds must be greater than zero".to_string());
        }
        if self.max_output_bytes == 0 || self.max_command_bytes == 0 {
            return Err("limits.max_output_bytes and limits.max_command_bytes must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        ttl_duration(self.default_ttl_seconds)
    }

    pub fn max_total_ttl(&self) -> chrono::Duration {
        ttl_duration(self.max_total_ttl_seconds)
    }

    pub fn exec_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.exec_timeout_seconds)
    }
}

/// Seconds as a chrono duration, clamped to [`MAX_TTL_SECONDS`].
pub fn ttl_duration(seconds: u64) -> chrono::Duration {
    i64::try_from(seconds.min(MAX_TTL_SECONDS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(ResourceLimits::default().validate().is_ok());
    }

    #[test]
    fn test_default_ttl_cannot_exceed_total() {
        let limits = ResourceLimits {
            default_ttl_seconds: 600,
            max_total_ttl_seconds: 300,
            ..Default::default()
        };
        let err = limits.validate().unwrap_err();
        assert!(err.contains("cannot exceed"));
    }

    #[test]
    fn test_rejects_zero_and_nan_values() {
        let limits = ResourceLimits {
            cpu_cores: f64::NAN,
            ..Default::default()
        };
        assert!(limits.validate().is_err());

        let limits = ResourceLimits {
            exec_timeout_seconds: 0,
            ..Default::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_ttls_are_bounded() {
        let limits = ResourceLimits {
            default_ttl_seconds: 600,
            max_total_ttl_seconds: MAX_TTL_SECONDS + 1,
            ..Default::default()
        };
        assert!(limits.validate().unwrap_err().contains("one year"));

        let limits = ResourceLimits {
            default_ttl_seconds: u64::MAX,
            max_total_ttl_seconds: u64::MAX,
            ..Default::default()
        };
        let year = chrono::Duration::seconds(MAX_TTL_SECONDS as i64);
        assert_eq!(limits.default_ttl(), year);
        assert_eq!(limits.max_total_ttl(), year);
        assert!(limits.default_ttl() > chrono::Duration::zero());
    }
}
