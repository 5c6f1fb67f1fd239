// Audit logger implementation

use super::storage::AuditStorage;
use super::types::{AuditAction, AuditEntry, AuditLevel, ResourceType};
use crate::certs::rotation::RotationOutcome;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};

/// Actor recorded for changes made by the rotation scheduler.
pub const ROTATION_ACTOR: &str = "rotation-scheduler";

/// Audit logger for key lifecycle changes and token issuance
#[derive(Clone)]
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
}

impl AuditLogger {
    /// Create a new audit logger with the specified storage backend
    pub fn new(storage: Arc<dyn AuditStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn AuditStorage> {
        &self.storage
    }

    /// Log an audit event
    pub async fn log(&self, entry: AuditEntry) {
        info!(
            "Audit: {} - {:?} {:?} by {:?} - success: {}",
            entry.action.as_str(),
            entry.resource_type,
            entry.resource_id,
            entry.actor,
            entry.success
        );

        if let Err(e) = self.storage.store(entry).await {
            error!("Failed to store audit entry: {}", e);
        }
    }

    /// Log every change one rotation pass made to a key
    pub async fn log_rotation(&self, outcome: &RotationOutcome) {
        let mut changes: Vec<(AuditAction, &str)> = Vec::new();
        if let Some(v) = &outcome.created {
            changes.push((AuditAction::KeyVersionCreated, v));
        }
        if let Some(v) = &outcome.promoted {
            changes.push((AuditAction::KeyVersionPromoted, v));
        }
        if let Some(v) = &outcome.demoted {
            changes.push((AuditAction::KeyVersionDemoted, v));
        }
        for v in &outcome.disabled {
            changes.push((AuditAction::KeyVersionDisabled, v));
        }
        for v in &outcome.destroy_scheduled {
            changes.push((AuditAction::KeyVersionDestroyScheduled, v));
        }

        for (action, version) in changes {
            let entry = AuditEntry::builder()
                .actor(ROTATION_ACTOR)
                .action(action)
                .resource_type(ResourceType::KeyVersion)
                .resource_id(version)
                .level(AuditLevel::Info)
                .success(true)
                .metadata("key", outcome.key.as_str())
                .build();

            self.log(entry).await;
        }
    }

    /// Log an operator override, whether or not it was applied. Applied
    /// overrides are critical; rejected ones are warnings.
    pub async fn log_certificate_action(
        &self,
        action: AuditAction,
        version: &str,
        actor: &str,
        reason: &str,
        error: Option<&str>,
    ) {
        let mut builder = AuditEntry::builder()
            .actor(actor)
            .action(action)
            .resource_type(ResourceType::KeyVersion)
            .resource_id(version)
            .level(AuditLevel::Critical)
            .success(true)
            .metadata("reason", reason);

        if let Some(err) = error {
            builder = builder.level(AuditLevel::Warning).error(err);
        }

        self.log(builder.build()).await;
    }

    /// Log issuance of a justification token
    pub async fn log_token_issued(
        &self,
        token_id: &str,
        subject: Option<&str>,
        key_version: &str,
        categories: &[String],
    ) {
        let mut builder = AuditEntry::builder()
            .action(AuditAction::TokenIssued)
            .resource_type(ResourceType::Token)
            .resource_id(token_id)
            .level(AuditLevel::Security)
            .success(true)
            .metadata("key_version", key_version)
            .metadata("categories", categories.join(","));

        if let Some(sub) = subject {
            builder = builder.actor(sub);
        }

        self.log(builder.build()).await;
    }

    /// Drop entries recorded before `before`, returning how many went.
    pub async fn purge_before(&self, before: DateTime<Utc>) -> usize {
        match self.storage.cleanup_old_entries(before).await {
            Ok(removed) => {
                if removed > 0 {
                    info!("Purged {} audit entries older than {}", removed, before);
                }
                removed
            }
            Err(e) => {
                error!("Failed to purge audit entries: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::storage::MemoryAuditStorage;
    use crate::audit::types::AuditQuery;

    #[tokio::test]
    async fn test_log_rotation_records_each_change() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let logger = AuditLogger::new(storage.clone());

        let outcome = RotationOutcome {
            key: "k".to_string(),
            created: Some("k/cryptoKeyVersions/2".to_string()),
            promoted: Some("k/cryptoKeyVersions/2".to_string()),
            demoted: Some("k/cryptoKeyVersions/1".to_string()),
            ..Default::default()
        };
        logger.log_rotation(&outcome).await;

        let results = storage.query(AuditQuery::default()).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|e| e.actor.as_deref() == Some(ROTATION_ACTOR)));

        let demoted = storage
            .query(AuditQuery {
                action: Some(AuditAction::KeyVersionDemoted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(demoted[0].resource_id.as_deref(), Some("k/cryptoKeyVersions/1"));
    }

    #[tokio::test]
    async fn test_log_failed_certificate_action() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let logger = AuditLogger::new(storage.clone());

        logger
            .log_certificate_action(
                AuditAction::ForceDisable,
                "k/cryptoKeyVersions/1",
                "ops@example.com",
                "suspected leak",
                Some("would orphan key"),
            )
            .await;

        let results = storage
            .query(AuditQuery {
                actor: Some("ops@example.com".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].level, AuditLevel::Warning);
        assert_eq!(results[0].metadata.get("reason").map(String::as_str), Some("suspected leak"));
    }

    #[tokio::test]
    async fn test_applied_certificate_action_is_critical() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let logger = AuditLogger::new(storage.clone());

        logger
            .log_certificate_action(
                AuditAction::ForceDisable,
                "k/cryptoKeyVersions/1",
                "ops@example.com",
                "scheduled drill",
                None,
            )
            .await;

        let results = storage.query(AuditQuery::default()).await.unwrap();
        assert!(results[0].success);
        assert_eq!(results[0].level, AuditLevel::Critical);
    }

    #[tokio::test]
    async fn test_purge_before_drops_old_entries() {
        let storage = Arc::new(MemoryAuditStorage::new());
        let logger = AuditLogger::new(storage.clone());
        let outcome = RotationOutcome {
            key: "k".to_string(),
            created: Some("k/cryptoKeyVersions/1".to_string()),
            ..Default::default()
        };
        logger.log_rotation(&outcome).await;

        assert_eq!(logger.purge_before(Utc::now() - chrono::Duration::hours(1)).await, 0);
        assert_eq!(logger.purge_before(Utc::now() + chrono::Duration::hours(1)).await, 1);
        assert!(storage.query(AuditQuery::default()).await.unwrap().is_empty());
    }
}
