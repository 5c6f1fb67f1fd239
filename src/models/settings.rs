use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration as StdDuration;

use crate::certs::backend::SigningAlgorithm;
use crate::certs::lifecycle::RotationPolicy;

/// Service configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// `iss` claim of issued tokens.
    pub issuer: String,
    /// Default `aud` claim, also the accepted audiences on verification.
    pub audiences: Vec<String>,
    /// Upper bound on a requested token lifetime.
    #[serde(default = "default_max_ttl")]
    pub max_ttl_secs: u64,
    /// Key whose primary version signs new tokens.
    pub signing_key: String,
    /// Individually managed keys.
    #[serde(default)]
    pub key_names: Vec<String>,
    /// Key rings whose every key is managed.
    #[serde(default)]
    pub key_rings: Vec<String>,
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Per-key overrides of the rotation timers.
    #[serde(default)]
    pub key_policies: HashMap<String, RotationPolicyConfig>,
    #[serde(default = "default_categories")]
    pub categories: Vec<CategoryRule>,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Audit entries older than this are dropped by the scheduler.
    #[serde(default = "default_audit_retention")]
    pub audit_retention_secs: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_max_ttl() -> u64 {
    3600
}

fn default_audit_retention() -> u64 {
    30 * 24 * 3600
}

fn default_categories() -> Vec<CategoryRule> {
    vec![CategoryRule::new("explanation", true)]
}

/// Rotation timers in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicyConfig {
    #[serde(default = "default_rotation_age")]
    pub rotation_age_secs: u64,
    #[serde(default = "default_propagation_delay")]
    pub propagation_delay_secs: u64,
    #[serde(default = "default_destroy_after")]
    pub destroy_after_secs: u64,
}

fn default_rotation_age() -> u64 {
    30 * 24 * 3600
}

fn default_propagation_delay() -> u64 {
    2 * 3600
}

fn default_destroy_after() -> u64 {
    24 * 3600
}

impl Default for RotationPolicyConfig {
    fn default() -> Self {
        Self {
            rotation_age_secs: default_rotation_age(),
            propagation_delay_secs: default_propagation_delay(),
            destroy_after_secs: default_destroy_after(),
        }
    }
}

impl RotationPolicyConfig {
    pub fn to_policy(&self) -> RotationPolicy {
        RotationPolicy::new(
            Duration::seconds(self.rotation_age_secs as i64),
            Duration::seconds(self.propagation_delay_secs as i64),
            Duration::seconds(self.destroy_after_secs as i64),
        )
    }

    fn validate(&self, scope: &str, max_ttl_secs: u64) -> Result<(), String> {
        if self.rotation_age_secs == 0
            || self.propagation_delay_secs == 0
            || self.destroy_after_secs == 0
        {
            return Err(format!("Rotation timers for {} must be non-zero", scope));
        }
        // A demoted version must outlive every token it signed.
        if self.propagation_delay_secs < max_ttl_secs {
            return Err(format!(
                "propagation_delay_secs for {} ({}) must be at least max_ttl_secs ({})",
                scope, self.propagation_delay_secs, max_ttl_secs
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(flatten)]
    pub policy: RotationPolicyConfig,
    /// Seconds between scheduler passes.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Deadline for one backend call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_check_interval() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    30
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            policy: RotationPolicyConfig::default(),
            check_interval_secs: default_check_interval(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl RotationConfig {
    pub fn check_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.check_interval_secs)
    }

    pub fn call_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.call_timeout_secs)
    }
}

/// A recognized justification category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub name: String,
    /// Whether justifications of this category need a non-empty value.
    #[serde(default = "default_value_required")]
    pub value_required: bool,
}

fn default_value_required() -> bool {
    true
}

impl CategoryRule {
    pub fn new(name: impl Into<String>, value_required: bool) -> Self {
        Self {
            name: name.into(),
            value_required,
        }
    }
}

/// Signing backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process KMS with generated key material.
    Software {
        #[serde(default = "default_algorithm")]
        algorithm: SigningAlgorithm,
    },
}

fn default_algorithm() -> SigningAlgorithm {
    SigningAlgorithm::EcSignP256Sha256
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Software {
            algorithm: default_algorithm(),
        }
    }
}

impl AppConfig {
    pub fn max_ttl(&self) -> Duration {
        Duration::seconds(self.max_ttl_secs as i64)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::seconds(self.audit_retention_secs as i64)
    }

    /// Whether `key` is one of the managed keys or lives in a managed ring.
    pub fn manages_key(&self, key: &str) -> bool {
        self.key_names.iter().any(|k| k == key)
            || self
                .key_rings
                .iter()
                .any(|ring| key.starts_with(&format!("{}/cryptoKeys/", ring)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.key_names.is_empty() && self.key_rings.is_empty() {
            return Err("Configuration must list at least one key or key ring".to_string());
        }
        if self.issuer.is_empty() {
            return Err("Configuration must have an issuer".to_string());
        }
        if self.audiences.is_empty() {
            return Err("Configuration must have at least one audience".to_string());
        }
        if self.max_ttl_secs == 0 {
            return Err("max_ttl_secs must be non-zero".to_string());
        }
        if self.audit_retention_secs == 0 || self.audit_retention_secs > i64::MAX as u64 / 1000 {
            return Err("audit_retention_secs must be non-zero and representable".to_string());
        }
        if !self.manages_key(&self.signing_key) {
            return Err(format!(
                "Signing key '{}' is not among the configured keys or key rings",
                self.signing_key
            ));
        }

        self.rotation.policy.validate("all keys", self.max_ttl_secs)?;
        if self.rotation.check_interval_secs == 0 || self.rotation.call_timeout_secs == 0 {
            return Err("check_interval_secs and call_timeout_secs must be non-zero".to_string());
        }
        for (key, policy) in &self.key_policies {
            if !self.manages_key(key) {
                return Err(format!("Rotation policy given for unmanaged key '{}'", key));
            }
            policy.validate(&format!("key '{}'", key), self.max_ttl_secs)?;
        }

        if self.categories.is_empty() {
            return Err("Configuration must have at least one justification category".to_string());
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.name.is_empty() {
                return Err("Justification category names must be non-empty".to_string());
            }
            if !seen.insert(category.name.as_str()) {
                return Err(format!("Duplicate justification category '{}'", category.name));
            }
        }

        Ok(())
    }
}
