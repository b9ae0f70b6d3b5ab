//! Instance specification and input validation.

use std::collections::BTreeMap;

use super::error::{RuntimeError, RuntimeResult};
use crate::limits::ResourceLimits;

/// Label marking an instance as owned by this service.
pub const MANAGED_LABEL: &str = "sandboxvm.managed";

/// Label carrying the public session id of the owning session.
pub const SESSION_LABEL: &str = "sandboxvm.session";

/// Everything a backend needs to create one isolated instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Instance name (unique per backend, derived from the session id).
    pub name: String,
    /// Public session id, recorded as a label for reconciliation.
    pub session_id: String,
    /// Resource quotas to apply.
    pub limits: ResourceLimits,
    /// Extra labels. The managed/session labels are always added.
    pub labels: BTreeMap<String, String>,
}

impl InstanceSpec {
    /// Build a spec for a session, naming the instance `<prefix>-<session suffix>`.
    pub fn for_session(prefix: &str, session_id: &str, limits: ResourceLimits) -> Self {
        let suffix = session_id.trim_start_matches("vm_");
        Self {
            name: format!("{prefix}-{suffix}"),
            session_id: session_id.to_string(),
            limits,
            labels: BTreeMap::new(),
        }
    }

    /// All labels including the ownership labels.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SESSION_LABEL.to_string(), self.session_id.clone());
        labels
    }

    /// Validate all fields before handing them to a backend.
    pub fn validate(&self) -> RuntimeResult<()> {
        validate_instance_name(&self.name)?;
        for (key, value) in &self.labels {
            validate_label(key, value)?;
        }
        validate_label(SESSION_LABEL, &self.session_id)?;
        Ok(())
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
/// Valid characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`
pub fn validate_image_name(image: &str) -> RuntimeResult<()> {
    if image.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(RuntimeError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.contains("..") {
        return Err(RuntimeError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate an instance name.
///
/// Names must be alphanumeric with hyphens and underscores and start with a
/// letter, digit or underscore. The same rule keeps local backend directory
/// names free of path separators.
pub fn validate_instance_name(name: &str) -> RuntimeResult<()> {
    if name.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "instance name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "instance name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let first_char = name.chars().next().unwrap_or('-');
    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(RuntimeError::InvalidInput(
            "instance name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "instance name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// Validate the configured instance name prefix.
pub fn validate_name_prefix(prefix: &str) -> RuntimeResult<()> {
    if prefix.len() > 64 {
        return Err(RuntimeError::InvalidInput(
            "name prefix exceeds maximum length of 64 characters".to_string(),
        ));
    }
    validate_instance_name(prefix)
}

/// Validate an instance handle (container ID or name).
pub fn validate_handle(id: &str) -> RuntimeResult<()> {
    if id.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "instance handle cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "instance handle exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "instance handle '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Validate a label key/value pair.
fn validate_label(key: &str, value: &str) -> RuntimeResult<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "label key must be between 1 and 128 characters".to_string(),
        ));
    }

    let valid_key = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !key.chars().all(valid_key) {
        return Err(RuntimeError::InvalidInput(format!(
            "label key '{}' contains invalid characters",
            key
        )));
    }

    if value.len() > 256 || value.chars().any(|c| c.is_control() || c == '=' || c == ',') {
        return Err(RuntimeError::InvalidInput(format!(
            "label value for '{}' is too long or contains invalid characters",
            key
        )));
    }

    Ok(())
}
