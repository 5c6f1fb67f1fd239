// Audit log storage backends

use super::types::{AuditEntry, AuditQuery};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Trait for audit log storage backends
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Store an audit entry
    async fn store(&self, entry: AuditEntry) -> Result<(), String>;

    /// Query audit entries, most recent first
    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, String>;

    /// Delete audit entries older than the specified timestamp
    async fn cleanup_old_entries(&self, before: DateTime<Utc>) -> Result<usize, String>;
}

/// In-memory audit storage implementation
pub struct MemoryAuditStorage {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

impl Default for MemoryAuditStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), String> {
        let mut entries = self.entries.write().await;
        debug!("Storing audit entry: {:?}", entry.action);
        entries.push(entry);
        Ok(())
    }

    async fn query(&self, query: AuditQuery) -> Result<Vec<AuditEntry>, String> {
        let entries = self.entries.read().await;

        let mut results: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| {
                if let Some(ref actor) = query.actor
                    && entry.actor.as_ref() != Some(actor)
                {
                    return false;
                }

                if let Some(action) = query.action
                    && entry.action != action
                {
                    return false;
                }

                if let Some(resource_type) = query.resource_type
                    && entry.resource_type != resource_type
                {
                    return false;
                }

                if let Some(ref resource_id) = query.resource_id
                    && entry.resource_id.as_ref() != Some(resource_id)
                {
                    return false;
                }

                if let Some(success) = query.success
                    && entry.success != success
                {
                    return false;
                }

                if let Some(min_level) = query.min_level
                    && entry.level < min_level
                {
                    return false;
                }

                // Filter by time range
                if let Some(start_time) = query.start_time
                    && entry.timestamp < start_time
                {
                    return false;
                }
                if let Some(end_time) = query.end_time
                    && entry.timestamp > end_time
                {
                    return false;
                }

                true
            })
            .cloned()
            .collect();

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(100);

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn cleanup_old_entries(&self, before: DateTime<Utc>) -> Result<usize, String> {
        let mut entries = self.entries.write().await;
        let initial = entries.len();
        entries.retain(|e| e.timestamp >= before);
        let removed = initial - entries.len();
        debug!("Removed {} audit entries older than {}", removed, before);
        Ok(removed)
    }
}
