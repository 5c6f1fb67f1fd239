//! Key version lifecycle model.
//!
//! Versions carry their lifecycle as opaque string labels on the backend. This
//! module owns the translation between those strings and the closed enums the
//! rest of the crate works with; raw label strings never leave this file.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use super::backend::{SigningAlgorithm, VersionRecord};

/// Version label holding the lifecycle stage.
pub const LIFECYCLE_LABEL: &str = "jvs-lifecycle";
/// Version label holding the unix time of the last lifecycle transition.
pub const LIFECYCLE_CHANGED_LABEL: &str = "jvs-lifecycle-changed";

/// Lifecycle stage of a key version. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleLabel {
    New,
    Primary,
    Old,
    Disabled,
}

impl LifecycleLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleLabel::New => "new",
            LifecycleLabel::Primary => "primary",
            LifecycleLabel::Old => "old",
            LifecycleLabel::Disabled => "disabled",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(LifecycleLabel::New),
            "primary" => Some(LifecycleLabel::Primary),
            "old" => Some(LifecycleLabel::Old),
            "disabled" => Some(LifecycleLabel::Disabled),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: LifecycleLabel) -> bool {
        next > *self
    }
}

impl fmt::Display for LifecycleLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a version as reported by the backend. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    Enabled,
    Disabled,
    ScheduledForDestruction,
    Destroyed,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Enabled => "ENABLED",
            BackendState::Disabled => "DISABLED",
            BackendState::ScheduledForDestruction => "SCHEDULED_FOR_DESTRUCTION",
            BackendState::Destroyed => "DESTROYED",
        }
    }

    pub fn can_transition_to(&self, next: BackendState) -> bool {
        next > *self
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels to write on a version when it enters `label` at `at`.
pub fn lifecycle_labels(label: LifecycleLabel, at: DateTime<Utc>) -> HashMap<String, String> {
    HashMap::from([
        (LIFECYCLE_LABEL.to_string(), label.as_str().to_string()),
        (LIFECYCLE_CHANGED_LABEL.to_string(), at.timestamp().to_string()),
    ])
}

/// One instance of key material under a managed key, as seen by core logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVersion {
    pub id: String,
    pub parent_key: String,
    pub create_time: DateTime<Utc>,
    pub label: LifecycleLabel,
    /// When `label` was entered, if the backend recorded it.
    pub label_changed_at: Option<DateTime<Utc>>,
    pub state: BackendState,
    pub algorithm: SigningAlgorithm,
    /// The stored label disagrees with `label` and must be rewritten.
    #[serde(skip)]
    pub needs_relabel: bool,
}

impl KeyVersion {
    pub fn is_enabled(&self) -> bool {
        self.state == BackendState::Enabled
    }

    pub fn is_primary(&self) -> bool {
        self.label == LifecycleLabel::Primary && self.is_enabled()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.create_time
    }

    /// Time spent in the current label, `None` when the entry time is unknown.
    pub fn time_in_label(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.label_changed_at.map(|at| now - at)
    }
}

/// All enumerable versions of one managed key, ordered by creation time.
#[derive(Debug, Clone)]
pub struct VersionSet {
    pub key: String,
    /// Version named by the key-level primary pointer.
    pub primary_pointer: Option<String>,
    pub versions: Vec<KeyVersion>,
}

impl VersionSet {
    /// Translates raw backend records into typed versions.
    pub fn from_records(
        key: &str,
        primary_pointer: Option<String>,
        mut records: Vec<VersionRecord>,
    ) -> Self {
        records.retain(|r| r.state != BackendState::Destroyed);
        records.sort_by_key(|r| r.create_time);

        let pointer_created = primary_pointer.as_deref().and_then(|p| {
            records
                .iter()
                .find(|r| r.name == p)
                .map(|r| r.create_time)
        });

        let versions = records
            .into_iter()
            .map(|record| translate(record, primary_pointer.as_deref(), pointer_created))
            .collect();

        Self {
            key: key.to_string(),
            primary_pointer,
            versions,
        }
    }

    /// The single enabled PRIMARY version, if any.
    pub fn primary(&self) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.is_primary())
    }

    /// Most recent enabled NEW version awaiting promotion.
    pub fn pending_new(&self) -> Option<&KeyVersion> {
        self.versions
            .iter()
            .rev()
            .find(|v| v.label == LifecycleLabel::New && v.is_enabled())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &KeyVersion> {
        self.versions.iter().filter(|v| v.is_enabled())
    }

    pub fn get(&self, id: &str) -> Option<&KeyVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn count_primary(&self) -> usize {
        self.versions.iter().filter(|v| v.label == LifecycleLabel::Primary).count()
    }
}

fn translate(
    record: VersionRecord,
    primary_pointer: Option<&str>,
    pointer_created: Option<DateTime<Utc>>,
) -> KeyVersion {
    let stored = record
        .labels
        .get(LIFECYCLE_LABEL)
        .and_then(|l| LifecycleLabel::parse(l));
    let stored_at = record
        .labels
        .get(LIFECYCLE_CHANGED_LABEL)
        .and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    let (label, label_changed_at) = if record.state != BackendState::Enabled {
        // A version the backend no longer serves is disabled for lifecycle purposes.
        match stored {
            Some(LifecycleLabel::Disabled) => (LifecycleLabel::Disabled, stored_at),
            _ => (LifecycleLabel::Disabled, None),
        }
    } else if primary_pointer == Some(record.name.as_str()) {
        match stored {
            Some(LifecycleLabel::Primary) => (LifecycleLabel::Primary, stored_at),
            _ => (LifecycleLabel::Primary, None),
        }
    } else {
        match stored {
            // Demoted by a pointer swap whose relabel never landed.
            Some(LifecycleLabel::Primary) => (LifecycleLabel::Old, None),
            // Lost a promotion to a newer version; retire it like a demoted one.
            Some(LifecycleLabel::New)
                if pointer_created.is_some_and(|at| record.create_time < at) =>
            {
                (LifecycleLabel::Old, None)
            }
            Some(label) => (label, stored_at),
            None => {
                let newer = pointer_created.is_none_or(|at| record.create_time > at);
                if newer {
                    (LifecycleLabel::New, None)
                } else {
                    (LifecycleLabel::Old, None)
                }
            }
        }
    };

    let needs_relabel = stored != Some(label) || label_changed_at.is_none();

    KeyVersion {
        id: record.name,
        parent_key: record.key,
        create_time: record.create_time,
        label,
        label_changed_at,
        state: record.state,
        algorithm: record.algorithm,
        needs_relabel,
    }
}

/// Per-key rotation timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Maximum age of a PRIMARY before a successor is created.
    pub rotation_age: Duration,
    /// Minimum time an OLD version stays enabled before it is disabled.
    pub propagation_delay: Duration,
    /// Minimum time a version stays DISABLED before destruction is requested.
    pub destroy_after: Duration,
}

impl RotationPolicy {
    pub fn new(
        rotation_age: Duration,
        propagation_delay: Duration,
        destroy_after: Duration,
    ) -> Self {
        Self {
            rotation_age,
            propagation_delay,
            destroy_after,
        }
    }

    pub fn with_rotation_age(mut self, age: Duration) -> Self {
        self.rotation_age = age;
        self
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    pub fn with_destroy_after(mut self, after: Duration) -> Self {
        self.destroy_after = after;
        self
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_age: Duration::days(30),
            propagation_delay: Duration::hours(2),
            destroy_after: Duration::days(1),
        }
    }
}

/// Source of wall-clock time for lifecycle decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to drive rotation timers in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}
