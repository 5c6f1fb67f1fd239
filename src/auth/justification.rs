use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{JvsError, ValidationErrors};
use crate::metrics;
use crate::models::CategoryRule;

/// A caller-supplied reason for a privileged action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    pub category: String,
    pub value: String,
}

impl Justification {
    pub fn new(category: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            value: value.into(),
        }
    }
}

/// Body of a token issuance request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JustificationRequest {
    #[serde(default)]
    pub justifications: Vec<Justification>,
    /// Token lifetime in seconds.
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Overrides the configured audiences when present.
    #[serde(default)]
    pub audiences: Option<Vec<String>>,
}

impl JustificationRequest {
    pub fn new(justifications: Vec<Justification>, ttl: Duration) -> Self {
        Self {
            justifications,
            ttl_secs: Some(ttl.num_seconds()),
            ..Default::default()
        }
    }

    /// The requested lifetime, if present, positive and representable.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs
            .filter(|secs| *secs > 0)
            .and_then(Duration::try_seconds)
    }
}

/// Checks requests against the configured justification categories.
///
/// Every violation is collected; a request is either fully valid or
/// rejected with the complete list.
#[derive(Debug, Clone)]
pub struct JustificationValidator {
    categories: HashMap<String, CategoryRule>,
    max_ttl: Duration,
}

impl JustificationValidator {
    pub fn new(categories: &[CategoryRule], max_ttl: Duration) -> Self {
        Self {
            categories: categories
                .iter()
                .map(|rule| (rule.name.clone(), rule.clone()))
                .collect(),
            max_ttl,
        }
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    pub fn validate(&self, request: &JustificationRequest) -> Result<Duration, JvsError> {
        let mut errors = ValidationErrors::new();

        if request.justifications.is_empty() {
            reject(&mut errors, "no_justifications", "no justifications".to_string());
        }

        // Compared as raw seconds, the client value may not fit a Duration.
        let max_secs = self.max_ttl.num_seconds();
        let ttl = match request.ttl_secs.filter(|secs| *secs > 0) {
            None => {
                reject(&mut errors, "no_ttl", "no ttl".to_string());
                None
            }
            Some(secs) if secs > max_secs => {
                reject(
                    &mut errors,
                    "ttl_exceeded",
                    format!("ttl {secs}s exceeds maximum of {max_secs}s"),
                );
                None
            }
            Some(secs) => Duration::try_seconds(secs),
        };

        for (i, just) in request.justifications.iter().enumerate() {
            match self.categories.get(&just.category) {
                None => reject(
                    &mut errors,
                    "unknown_category",
                    format!("justification {i}: unexpected category {:?}", just.category),
                ),
                Some(rule) if rule.value_required && just.value.trim().is_empty() => reject(
                    &mut errors,
                    "empty_value",
                    format!(
                        "justification {i}: category {:?} requires a non-empty value",
                        just.category
                    ),
                ),
                Some(_) => {}
            }
        }

        errors.into_result()?;
        ttl.ok_or_else(|| JvsError::Internal("ttl missing after validation".to_string()))
    }
}

fn reject(errors: &mut ValidationErrors, reason: &str, message: String) {
    metrics::record_validation_failure(reason);
    errors.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> JustificationValidator {
        JustificationValidator::new(
            &[
                CategoryRule::new("explanation", true),
                CategoryRule::new("ticket", false),
            ],
            Duration::hours(1),
        )
    }

    fn violations(err: JvsError) -> Vec<String> {
        match err {
            JvsError::Validation(v) => v.violations().to_vec(),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_valid_request() {
        let req = JustificationRequest::new(
            vec![Justification::new("explanation", "on-call incident 123")],
            Duration::minutes(10),
        );
        assert_eq!(validator().validate(&req).unwrap(), Duration::minutes(10));
    }

    #[test]
    fn test_empty_request_reports_everything() {
        let req = JustificationRequest::default();
        let v = violations(validator().validate(&req).unwrap_err());
        assert_eq!(v, vec!["no justifications".to_string(), "no ttl".to_string()]);
    }

    #[test]
    fn test_non_positive_ttl_is_missing() {
        let mut req = JustificationRequest::new(
            vec![Justification::new("explanation", "x")],
            Duration::zero(),
        );
        assert_eq!(violations(validator().validate(&req).unwrap_err()), vec!["no ttl"]);

        req.ttl_secs = Some(-5);
        assert!(validator().validate(&req).is_err());
    }

    #[test]
    fn test_huge_ttl_is_rejected_not_panicking() {
        let mut req = JustificationRequest::new(
            vec![Justification::new("explanation", "x")],
            Duration::minutes(1),
        );
        req.ttl_secs = Some(i64::MAX);

        let v = violations(validator().validate(&req).unwrap_err());
        assert_eq!(
            v,
            vec![format!("ttl {}s exceeds maximum of 3600s", i64::MAX)]
        );
        assert!(req.ttl().is_none());
    }

    #[test]
    fn test_each_bad_justification_is_reported() {
        let req = JustificationRequest::new(
            vec![
                Justification::new("explanation", ""),
                Justification::new("vibes", "trust me"),
                Justification::new("ticket", ""),
            ],
            Duration::hours(2),
        );
        let v = violations(validator().validate(&req).unwrap_err());
        assert_eq!(v.len(), 3);
        assert!(v[0].contains("exceeds maximum"));
        assert!(v[1].contains("non-empty value"));
        assert!(v[2].contains("\"vibes\""));
    }
}
