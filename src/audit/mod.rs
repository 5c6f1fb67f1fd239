// Audit trail for key lifecycle changes, operator overrides and token issuance

pub mod logger;
pub mod storage;
pub mod types;

pub use logger::AuditLogger;
pub use storage::{AuditStorage, MemoryAuditStorage};
pub use types::{AuditAction, AuditEntry, AuditLevel, AuditQuery, ResourceType};
