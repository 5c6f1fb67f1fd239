//! Manual overrides for emergency key revocation.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use super::backend::{VersionRecord, parent_key};
use super::lifecycle::{BackendState, LifecycleLabel, lifecycle_labels};
use super::rotation::RotationEngine;
use crate::audit::{AuditAction, AuditLogger};
use crate::error::{BackendError, JvsError};
use crate::metrics;

/// Result of an applied certificate action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateActionOutcome {
    pub key: String,
    pub version: String,
    pub state: BackendState,
    /// Version promoted because the disabled version was the primary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Set when the follow-up rotation failed. The disable still stands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_error: Option<String>,
}

pub struct CertificateActionService {
    engine: Arc<RotationEngine>,
    audit: Arc<AuditLogger>,
}

impl CertificateActionService {
    pub fn new(engine: Arc<RotationEngine>, audit: Arc<AuditLogger>) -> Self {
        Self { engine, audit }
    }

    /// Disables `version` immediately regardless of its age.
    ///
    /// Refuses to disable the last enabled version of a key. Disabling the
    /// current primary clears the key's primary pointer and rotates the key
    /// so a new signer exists.
    pub async fn force_disable(
        &self,
        version: &str,
        actor: &str,
        reason: &str,
    ) -> Result<CertificateActionOutcome, JvsError> {
        let result = self.disable(version).await;
        self.audit_attempt(AuditAction::ForceDisable, version, actor, reason, &result)
            .await;
        result
    }

    /// Requests destruction of a version that is already disabled.
    pub async fn force_destroy(
        &self,
        version: &str,
        actor: &str,
        reason: &str,
    ) -> Result<CertificateActionOutcome, JvsError> {
        let result = self.destroy(version).await;
        self.audit_attempt(AuditAction::ForceDestroy, version, actor, reason, &result)
            .await;
        result
    }

    async fn audit_attempt(
        &self,
        action: AuditAction,
        version: &str,
        actor: &str,
        reason: &str,
        result: &Result<CertificateActionOutcome, JvsError>,
    ) {
        let error = match result {
            Ok(outcome) => outcome.rotation_error.clone(),
            Err(e) => {
                warn!(
                    version = %version,
                    actor = %actor,
                    error = %e,
                    "Certificate action rejected"
                );
                Some(e.to_string())
            }
        };
        self.audit
            .log_certificate_action(action, version, actor, reason, error.as_deref())
            .await;
    }

    async fn fetch(&self, version: &str) -> Result<(String, VersionRecord), JvsError> {
        let key = parent_key(version)
            .ok_or_else(|| JvsError::VersionNotFound(version.to_string()))?
            .to_string();
        let record = self
            .engine
            .call(self.engine.backend().get_version(version))
            .await?;
        Ok((key, record))
    }

    async fn disable(&self, version: &str) -> Result<CertificateActionOutcome, JvsError> {
        let (key, record) = self.fetch(version).await?;
        if record.state != BackendState::Enabled {
            return Err(JvsError::InvalidStateTransition {
                version: version.to_string(),
                from: record.state.to_string(),
                to: BackendState::Disabled.to_string(),
            });
        }

        let set = self.engine.load(&key).await?;
        if set.enabled().all(|v| v.id == version) {
            return Err(JvsError::WouldOrphanKey {
                key,
                version: version.to_string(),
            });
        }

        let backend = self.engine.backend();
        let was_primary = set.primary_pointer.as_deref() == Some(version);
        if was_primary {
            self.engine
                .call(backend.swap_primary(&key, Some(version), None))
                .await
                .map_err(|e| match e {
                    JvsError::RemoteService(BackendError::Aborted(_)) => {
                        JvsError::ConcurrentModification { key: key.clone() }
                    }
                    other => other,
                })?;
            warn!(key = %key, version = %version, "Cleared primary pointer for forced disable");
        }

        self.engine.call(backend.disable_version(version)).await?;
        self.engine
            .call(backend.update_labels(
                version,
                lifecycle_labels(LifecycleLabel::Disabled, self.engine.now()),
            ))
            .await?;

        let mut outcome = CertificateActionOutcome {
            key: key.clone(),
            version: version.to_string(),
            state: BackendState::Disabled,
            replacement: None,
            rotation_error: None,
        };

        if was_primary {
            match self.engine.rotate(&key).await {
                Ok(rotation) => {
                    metrics::record_rotation_outcome(&rotation);
                    self.audit.log_rotation(&rotation).await;
                    outcome.replacement = rotation.promoted;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Rotation after forced disable failed");
                    metrics::record_rotation_failures(1);
                    outcome.rotation_error = Some(e.to_string());
                }
            }
        }

        Ok(outcome)
    }

    async fn destroy(&self, version: &str) -> Result<CertificateActionOutcome, JvsError> {
        let (key, record) = self.fetch(version).await?;
        if record.state != BackendState::Disabled {
            return Err(JvsError::InvalidStateTransition {
                version: version.to_string(),
                from: record.state.to_string(),
                to: BackendState::ScheduledForDestruction.to_string(),
            });
        }

        self.engine
            .call(self.engine.backend().destroy_version(version))
            .await?;

        Ok(CertificateActionOutcome {
            key,
            version: version.to_string(),
            state: BackendState::ScheduledForDestruction,
            replacement: None,
            rotation_error: None,
        })
    }
}
