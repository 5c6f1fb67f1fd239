use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backend::SigningBackend;
use super::lifecycle::{
    BackendState, Clock, KeyVersion, LifecycleLabel, RotationPolicy, SystemClock, VersionSet,
    lifecycle_labels,
};
use crate::audit::logger::AuditLogger;
use crate::error::{BackendError, JvsError, KeyFailure, RotationError};
use crate::metrics;

/// Default deadline for a single backend call.
pub const DEFAULT_CALL_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// What one `rotate` call changed for a key. Empty means nothing was due.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationOutcome {
    pub key: String,
    pub created: Option<String>,
    pub promoted: Option<String>,
    pub demoted: Option<String>,
    pub disabled: Vec<String>,
    pub destroy_scheduled: Vec<String>,
    /// Versions whose stored labels were rewritten to match their lifecycle.
    pub relabeled: Vec<String>,
}

impl RotationOutcome {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Default::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.created.is_none()
            && self.promoted.is_none()
            && self.demoted.is_none()
            && self.disabled.is_empty()
            && self.destroy_scheduled.is_empty()
            && self.relabeled.is_empty()
    }
}

/// Advances managed keys through NEW -> PRIMARY -> OLD -> DISABLED and
/// requests destruction of long-disabled versions.
///
/// Every step re-derives what to do from the backend's version registry, so
/// `rotate` is idempotent and resumes cleanly after a cancelled run.
pub struct RotationEngine {
    backend: Arc<dyn SigningBackend>,
    default_policy: RotationPolicy,
    policies: HashMap<String, RotationPolicy>,
    clock: Arc<dyn Clock>,
    call_timeout: StdDuration,
}

impl RotationEngine {
    pub fn new(backend: Arc<dyn SigningBackend>, default_policy: RotationPolicy) -> Self {
        Self {
            backend,
            default_policy,
            policies: HashMap::new(),
            clock: Arc::new(SystemClock),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_call_timeout(mut self, timeout: StdDuration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Overrides the default policy for one key.
    pub fn with_policy(mut self, key: impl Into<String>, policy: RotationPolicy) -> Self {
        self.policies.insert(key.into(), policy);
        self
    }

    pub fn policy_for(&self, key: &str) -> &RotationPolicy {
        self.policies.get(key).unwrap_or(&self.default_policy)
    }

    pub fn backend(&self) -> &Arc<dyn SigningBackend> {
        &self.backend
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Runs one backend call under the configured deadline.
    pub(crate) async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, JvsError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(JvsError::from),
            Err(_) => Err(JvsError::RemoteService(BackendError::DeadlineExceeded(
                self.call_timeout,
            ))),
        }
    }

    /// Reads the key's primary pointer and versions as one typed snapshot.
    pub async fn load(&self, key: &str) -> Result<VersionSet, JvsError> {
        let pointer = self.call(self.backend.get_primary(key)).await?;
        let records = self.call(self.backend.list_versions(key)).await?;
        Ok(VersionSet::from_records(key, pointer, records))
    }

    /// The version new tokens must be signed with.
    pub async fn get_primary(&self, key: &str) -> Result<KeyVersion, JvsError> {
        let set = self.load(key).await?;
        set.primary().cloned().ok_or_else(|| JvsError::NoPrimaryKey {
            key: key.to_string(),
        })
    }

    /// Every version the backend still serves, newest first.
    pub async fn enabled_versions(&self, key: &str) -> Result<Vec<KeyVersion>, JvsError> {
        let set = self.load(key).await?;
        let mut enabled: Vec<KeyVersion> = set.enabled().cloned().collect();
        enabled.reverse();
        Ok(enabled)
    }

    /// Applies whatever lifecycle actions are currently due for `key`.
    pub async fn rotate(&self, key: &str) -> Result<RotationOutcome, JvsError> {
        let policy = *self.policy_for(key);
        let now = self.clock.now();
        let mut outcome = RotationOutcome::new(key);
        let mut set = self.load(key).await?;

        self.reconcile_labels(&mut set, now, &mut outcome).await?;

        let due = match set.primary() {
            None => true,
            Some(primary) => primary.age(now) >= policy.rotation_age,
        };
        if due {
            self.promote(&mut set, now, &mut outcome).await?;
        }

        self.disable_propagated(&mut set, &policy, now, &mut outcome)
            .await?;
        self.schedule_destruction(&set, &policy, now, &mut outcome)
            .await?;

        if outcome.is_noop() {
            debug!(key = %key, "No rotation actions due");
        } else {
            info!(
                key = %key,
                created = ?outcome.created,
                promoted = ?outcome.promoted,
                demoted = ?outcome.demoted,
                disabled = outcome.disabled.len(),
                destroy_scheduled = outcome.destroy_scheduled.len(),
                "Rotation actions applied"
            );
        }
        Ok(outcome)
    }

    /// Rewrites stored labels that disagree with the derived lifecycle, e.g.
    /// after a run was cancelled between two label writes.
    async fn reconcile_labels(
        &self,
        set: &mut VersionSet,
        now: DateTime<Utc>,
        outcome: &mut RotationOutcome,
    ) -> Result<(), JvsError> {
        for version in set.versions.iter_mut().filter(|v| v.needs_relabel) {
            let at = version.label_changed_at.unwrap_or(now);
            self.call(
                self.backend
                    .update_labels(&version.id, lifecycle_labels(version.label, at)),
            )
            .await?;
            warn!(
                version = %version.id,
                label = %version.label,
                "Reconciled stale lifecycle label"
            );
            version.label_changed_at = Some(at);
            version.needs_relabel = false;
            outcome.relabeled.push(version.id.clone());
        }
        Ok(())
    }

    async fn promote(
        &self,
        set: &mut VersionSet,
        now: DateTime<Utc>,
        outcome: &mut RotationOutcome,
    ) -> Result<(), JvsError> {
        let key = set.key.clone();
        let prior = set.primary().map(|v| v.id.clone());
        let prior_created = set.primary().map(|v| v.create_time);

        let pending = set
            .pending_new()
            .filter(|v| prior_created.is_none_or(|at| v.create_time > at))
            .map(|v| v.id.clone());
        let candidate = match pending {
            Some(id) => {
                debug!(key = %key, version = %id, "Resuming promotion of existing version");
                id
            }
            None => {
                let record = self
                    .call(
                        self.backend
                            .create_version(&key, lifecycle_labels(LifecycleLabel::New, now)),
                    )
                    .await?;
                info!(key = %key, version = %record.name, "Created key version");
                outcome.created = Some(record.name.clone());
                record.name
            }
        };

        // The candidate must be usable before the current signer is demoted.
        self.call(self.backend.get_public_key(&candidate)).await?;

        let fresh = self.load(&key).await?;
        let fresh_primary = fresh.primary().map(|v| v.id.clone());
        if fresh.primary_pointer != set.primary_pointer || fresh_primary != prior {
            warn!(key = %key, "Primary changed while promoting, aborting");
            return Err(JvsError::ConcurrentModification { key });
        }

        self.call(self.backend.swap_primary(
            &key,
            set.primary_pointer.as_deref(),
            Some(&candidate),
        ))
        .await
        .map_err(|e| match e {
            JvsError::RemoteService(BackendError::Aborted(_)) => {
                JvsError::ConcurrentModification { key: key.clone() }
            }
            other => other,
        })?;

        self.call(
            self.backend
                .update_labels(&candidate, lifecycle_labels(LifecycleLabel::Primary, now)),
        )
        .await?;
        info!(key = %key, version = %candidate, "Promoted key version to primary");
        outcome.promoted = Some(candidate.clone());

        if let Some(prior) = &prior {
            self.call(
                self.backend
                    .update_labels(prior, lifecycle_labels(LifecycleLabel::Old, now)),
            )
            .await?;
            info!(key = %key, version = %prior, "Demoted key version to old");
            outcome.demoted = Some(prior.clone());
        }

        set.primary_pointer = Some(candidate.clone());
        for version in set.versions.iter_mut() {
            if Some(&version.id) == prior.as_ref() {
                version.label = LifecycleLabel::Old;
                version.label_changed_at = Some(now);
            } else if version.id == candidate {
                version.label = LifecycleLabel::Primary;
                version.label_changed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn disable_propagated(
        &self,
        set: &mut VersionSet,
        policy: &RotationPolicy,
        now: DateTime<Utc>,
        outcome: &mut RotationOutcome,
    ) -> Result<(), JvsError> {
        for version in set.versions.iter_mut() {
            let retired = matches!(version.label, LifecycleLabel::Old | LifecycleLabel::Disabled);
            let propagated = version
                .time_in_label(now)
                .is_some_and(|t| t >= policy.propagation_delay);
            if !(version.is_enabled() && retired && propagated) {
                continue;
            }

            self.call(self.backend.disable_version(&version.id)).await?;
            self.call(
                self.backend
                    .update_labels(&version.id, lifecycle_labels(LifecycleLabel::Disabled, now)),
            )
            .await?;
            info!(version = %version.id, "Disabled key version after propagation delay");

            version.label = LifecycleLabel::Disabled;
            version.label_changed_at = Some(now);
            version.state = BackendState::Disabled;
            outcome.disabled.push(version.id.clone());
        }
        Ok(())
    }

    async fn schedule_destruction(
        &self,
        set: &VersionSet,
        policy: &RotationPolicy,
        now: DateTime<Utc>,
        outcome: &mut RotationOutcome,
    ) -> Result<(), JvsError> {
        for version in &set.versions {
            let eligible = version.state == BackendState::Disabled
                && version.label == LifecycleLabel::Disabled
                && version
                    .time_in_label(now)
                    .is_some_and(|t| t >= policy.destroy_after);
            if !eligible {
                continue;
            }

            self.call(self.backend.destroy_version(&version.id)).await?;
            info!(version = %version.id, "Scheduled key version for destruction");
            outcome.destroy_scheduled.push(version.id.clone());
        }
        Ok(())
    }

    /// Expands key rings into their member keys. A ring that cannot be listed
    /// is reported as a failure under the ring's name.
    pub async fn resolve_keys(
        &self,
        key_names: &[String],
        key_rings: &[String],
    ) -> (Vec<String>, Vec<KeyFailure>) {
        let mut keys: BTreeSet<String> = key_names.iter().cloned().collect();
        let mut failures = Vec::new();

        for ring in key_rings {
            match self.call(self.backend.list_keys(ring)).await {
                Ok(members) => keys.extend(members),
                Err(error) => {
                    error!(key_ring = %ring, error = %error, "Failed to list key ring");
                    failures.push(KeyFailure {
                        key: ring.clone(),
                        error,
                    });
                }
            }
        }

        (keys.into_iter().collect(), failures)
    }

    /// Rotates every key concurrently. Each key is rotated at most once per
    /// pass; one key's failure never stops the others.
    pub async fn rotate_all(
        self: &Arc<Self>,
        keys: &[String],
    ) -> Result<Vec<RotationOutcome>, RotationError> {
        self.rotate_all_with(keys, Vec::new()).await
    }

    async fn rotate_all_with(
        self: &Arc<Self>,
        keys: &[String],
        mut failures: Vec<KeyFailure>,
    ) -> Result<Vec<RotationOutcome>, RotationError> {
        let unique: BTreeSet<&String> = keys.iter().collect();
        let handles: Vec<_> = unique
            .into_iter()
            .map(|key| {
                let engine = Arc::clone(self);
                let task_key = key.clone();
                (
                    key.clone(),
                    tokio::spawn(async move { engine.rotate(&task_key).await }),
                )
            })
            .collect();

        let mut outcomes = Vec::new();
        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(error)) => {
                    error!(key = %key, error = %error, "Rotation failed");
                    failures.push(KeyFailure { key, error });
                }
                Err(join_error) => {
                    error!(key = %key, error = %join_error, "Rotation task aborted");
                    failures.push(KeyFailure {
                        key,
                        error: JvsError::Internal(join_error.to_string()),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(outcomes)
        } else {
            Err(RotationError {
                failures,
                succeeded: outcomes,
            })
        }
    }

    /// Rotation trigger over configured keys and key rings.
    pub async fn rotate_configured(
        self: &Arc<Self>,
        key_names: &[String],
        key_rings: &[String],
    ) -> Result<Vec<RotationOutcome>, RotationError> {
        let (keys, ring_failures) = self.resolve_keys(key_names, key_rings).await;
        self.rotate_all_with(&keys, ring_failures).await
    }
}

/// Periodically invokes the rotation trigger for every configured key.
pub struct RotationScheduler {
    engine: Arc<RotationEngine>,
    key_names: Vec<String>,
    key_rings: Vec<String>,
    check_interval: StdDuration,
    audit: Option<Arc<AuditLogger>>,
    audit_retention: Option<chrono::Duration>,
}

impl RotationScheduler {
    pub fn new(
        engine: Arc<RotationEngine>,
        key_names: Vec<String>,
        key_rings: Vec<String>,
    ) -> Self {
        Self {
            engine,
            key_names,
            key_rings,
            check_interval: StdDuration::from_secs(300),
            audit: None,
            audit_retention: None,
        }
    }

    pub fn with_check_interval(mut self, interval: StdDuration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Each pass drops audit entries older than `retention`.
    pub fn with_audit_retention(mut self, retention: chrono::Duration) -> Self {
        self.audit_retention = Some(retention);
        self
    }

    pub fn engine(&self) -> &Arc<RotationEngine> {
        &self.engine
    }

    /// One pass over all configured keys.
    pub async fn run_once(&self) -> Result<Vec<RotationOutcome>, RotationError> {
        let result = self
            .engine
            .rotate_configured(&self.key_names, &self.key_rings)
            .await;

        let outcomes = match &result {
            Ok(outcomes) => outcomes,
            Err(err) => {
                metrics::record_rotation_failures(err.failures.len());
                &err.succeeded
            }
        };
        for outcome in outcomes {
            metrics::record_rotation_outcome(outcome);
            if let Some(audit) = &self.audit
                && !outcome.is_noop()
            {
                audit.log_rotation(outcome).await;
            }
        }

        // Entries are stamped with wall time, not the engine clock.
        if let Some(audit) = &self.audit
            && let Some(retention) = self.audit_retention
            && let Some(cutoff) = Utc::now().checked_sub_signed(retention)
        {
            audit.purge_before(cutoff).await;
        }
        result
    }

    /// Runs passes every `check_interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            "Starting key rotation scheduler"
        );
        let mut ticker = tokio::time::interval(self.check_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Key rotation scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(outcomes) => {
                            let changed = outcomes.iter().filter(|o| !o.is_noop()).count();
                            debug!(keys = outcomes.len(), changed, "Rotation pass complete");
                        }
                        Err(err) => {
                            error!(failed = ?err.failed_keys(), "Rotation pass failed: {}", err);
                        }
                    }
                }
            }
        }
    }
}
