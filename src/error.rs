//! Error taxonomy shared by the rotation engine, the signing pipeline and the
//! verification utility.

use std::fmt;

use thiserror::Error;

use crate::certs::rotation::RotationOutcome;

/// Failures reported by a remote signing backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A compare-and-swap on key metadata lost against a concurrent writer.
    #[error("aborted: {0}")]
    Aborted(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// Every violation found while validating a justification request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    violations: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.violations.push(violation.into());
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Ok when nothing was collected, otherwise the aggregate as an error.
    pub fn into_result(self) -> Result<(), JvsError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(JvsError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.violations.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum JvsError {
    /// Bad request shape. Never retried.
    #[error("invalid request: {0}")]
    Validation(ValidationErrors),

    /// Transient backend failure. Safe to retry the whole operation.
    #[error("remote service error: {0}")]
    RemoteService(#[source] BackendError),

    #[error("disabling {version} would leave key {key} without an enabled version")]
    WouldOrphanKey { key: String, version: String },

    #[error("invalid state transition for {version}: {from} -> {to}")]
    InvalidStateTransition {
        version: String,
        from: String,
        to: String,
    },

    #[error("primary of key {key} changed concurrently")]
    ConcurrentModification { key: String },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("no primary version for key {key}")]
    NoPrimaryKey { key: String },

    #[error("no enabled version for key {key}")]
    KeyUnavailable { key: String },

    #[error("token signature does not match any enabled key version")]
    SignatureInvalid,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("key version not found: {0}")]
    VersionNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JvsError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JvsError::RemoteService(
                BackendError::Unavailable(_) | BackendError::DeadlineExceeded(_)
            ) | JvsError::ConcurrentModification { .. }
        )
    }

    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            JvsError::WouldOrphanKey { .. }
                | JvsError::InvalidStateTransition { .. }
                | JvsError::ConcurrentModification { .. }
        )
    }
}

impl From<BackendError> for JvsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(name) => JvsError::VersionNotFound(name),
            BackendError::Crypto(msg) => JvsError::Signing(msg),
            other => JvsError::RemoteService(other),
        }
    }
}

/// Failure of a single key within a rotation pass.
#[derive(Debug)]
pub struct KeyFailure {
    pub key: String,
    pub error: JvsError,
}

/// Aggregate result of a rotation pass in which at least one key failed.
///
/// Every configured key was attempted; `succeeded` holds the outcomes of the
/// keys that completed.
#[derive(Debug)]
pub struct RotationError {
    pub failures: Vec<KeyFailure>,
    pub succeeded: Vec<RotationOutcome>,
}

impl RotationError {
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.key.as_str()).collect()
    }

    pub fn succeeded_keys(&self) -> Vec<&str> {
        self.succeeded.iter().map(|o| o.key.as_str()).collect()
    }
}

impl fmt::Display for RotationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rotation failed for {} key(s):", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.key, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for RotationError {}
