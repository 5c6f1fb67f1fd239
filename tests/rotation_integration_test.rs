use async_trait::async_trait;
use chrono::{Duration, Utc};
use justification_api::auth::{
    Justification, JustificationRequest, JustificationValidator, SigningPipeline,
    VerificationUtility,
};
use justification_api::certs::backend::{
    PublicKeyPem, SigningAlgorithm, SigningBackend, SoftwareKmsBackend, VersionRecord,
};
use justification_api::certs::lifecycle::lifecycle_labels;
use justification_api::certs::{
    BackendState, LifecycleLabel, ManualClock, RotationEngine, RotationPolicy,
};
use justification_api::error::{BackendError, JvsError};
use justification_api::models::CategoryRule;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const RING: &str = "projects/p/locations/global/keyRings/jvs";

fn key(name: &str) -> String {
    format!("{RING}/cryptoKeys/{name}")
}

fn policy() -> RotationPolicy {
    RotationPolicy::new(Duration::days(30), Duration::hours(2), Duration::days(1))
}

async fn setup(keys: &[&str]) -> (Arc<ManualClock>, Arc<SoftwareKmsBackend>, Arc<RotationEngine>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let backend = Arc::new(SoftwareKmsBackend::with_clock(clock.clone()));
    for name in keys {
        backend.create_key(&key(name), SigningAlgorithm::EcSignP256Sha256).await;
    }
    let engine = Arc::new(RotationEngine::new(backend.clone(), policy()).with_clock(clock.clone()));
    (clock, backend, engine)
}

/// Primary pointer always names an enabled version once the key is bootstrapped.
async fn assert_single_enabled_primary(engine: &RotationEngine, key: &str) {
    let set = engine.load(key).await.unwrap();
    assert_eq!(set.count_primary(), 1, "exactly one PRIMARY for {key}");
    let primary = set.primary().expect("primary exists");
    assert_eq!(set.primary_pointer.as_deref(), Some(primary.id.as_str()));
    assert!(primary.is_enabled());
}

#[tokio::test]
async fn test_no_signing_gap_over_many_rotations() {
    let (clock, _backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");
    engine.rotate(&signer).await.unwrap();

    let mut promotions = 0;
    // 120 days in 6 hour steps.
    for _ in 0..480 {
        clock.advance(Duration::hours(6));
        let outcome = engine.rotate(&signer).await.unwrap();
        if outcome.promoted.is_some() {
            promotions += 1;
        }
        assert_single_enabled_primary(&engine, &signer).await;
    }

    assert_eq!(promotions, 4);
}

#[tokio::test]
async fn test_demoted_version_stays_enabled_for_propagation_delay() {
    let (clock, _backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");
    let first = engine.rotate(&signer).await.unwrap().promoted.unwrap();

    clock.advance(Duration::days(30));
    engine.rotate(&signer).await.unwrap();

    for _ in 0..7 {
        clock.advance(Duration::minutes(17));
        engine.rotate(&signer).await.unwrap();
        let enabled: Vec<String> = engine
            .enabled_versions(&signer)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert!(enabled.contains(&first), "OLD version disabled too early");
    }

    clock.advance(Duration::minutes(1));
    let outcome = engine.rotate(&signer).await.unwrap();
    assert_eq!(outcome.disabled, vec![first]);
}

/// A token signed just before its version is demoted keeps verifying for
/// its whole lifetime.
#[tokio::test]
async fn test_tokens_verify_across_rotations() {
    let (clock, _backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");
    engine.rotate(&signer).await.unwrap();

    let audiences = vec!["dev.example.jvs".to_string()];
    let pipeline = SigningPipeline::new(
        engine.clone(),
        signer.clone(),
        "jvs.example.com",
        audiences.clone(),
        JustificationValidator::new(&[CategoryRule::new("explanation", true)], Duration::hours(1)),
    );
    let verifier = VerificationUtility::new(engine.clone(), "jvs.example.com", audiences);
    let request = JustificationRequest::new(
        vec![Justification::new("explanation", "incident review")],
        Duration::hours(1),
    );

    for _ in 0..40 {
        clock.advance(Duration::hours(23));
        let token = pipeline.create_token(&request).await.unwrap();
        engine.rotate(&signer).await.unwrap();

        // Just inside the token lifetime, after any demotion above.
        clock.advance(Duration::minutes(59));
        engine.rotate(&signer).await.unwrap();
        verifier.verify_token(&signer, &token).await.unwrap();

        clock.advance(Duration::minutes(2));
        assert!(matches!(
            verifier.verify_token(&signer, &token).await,
            Err(JvsError::InvalidToken(_))
        ));
    }
}

#[tokio::test]
async fn test_rotate_twice_is_noop() {
    let (clock, backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");

    for step in [Duration::zero(), Duration::days(31), Duration::hours(3), Duration::days(2)] {
        clock.advance(step);
        engine.rotate(&signer).await.unwrap();
        let mutations = backend.mutation_count();
        let again = engine.rotate(&signer).await.unwrap();
        assert!(again.is_noop(), "second rotate changed something: {again:?}");
        assert_eq!(backend.mutation_count(), mutations);
    }
}

#[tokio::test]
async fn test_full_lifecycle_reaches_destruction() {
    let (clock, backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");
    let first = engine.rotate(&signer).await.unwrap().promoted.unwrap();

    clock.advance(Duration::days(31));
    engine.rotate(&signer).await.unwrap();
    clock.advance(Duration::hours(2));
    engine.rotate(&signer).await.unwrap();
    clock.advance(Duration::days(1));
    let outcome = engine.rotate(&signer).await.unwrap();
    assert_eq!(outcome.destroy_scheduled, vec![first.clone()]);

    let record = backend.get_version(&first).await.unwrap();
    assert_eq!(record.state, BackendState::ScheduledForDestruction);

    // Destroyed versions are no longer enumerated.
    clock.advance(Duration::hours(25));
    let set = engine.load(&signer).await.unwrap();
    assert!(set.get(&first).is_none());
    assert_eq!(set.versions.len(), 1);
}

#[tokio::test]
async fn test_externally_disabled_version_is_adopted() {
    let (clock, backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");
    let first = engine.rotate(&signer).await.unwrap().promoted.unwrap();
    clock.advance(Duration::days(31));
    engine.rotate(&signer).await.unwrap();

    // Disabled out of band, label still says old.
    backend.disable_version(&first).await.unwrap();
    let outcome = engine.rotate(&signer).await.unwrap();
    assert_eq!(outcome.relabeled, vec![first.clone()]);

    let set = engine.load(&signer).await.unwrap();
    let v = set.get(&first).unwrap();
    assert_eq!(v.label, LifecycleLabel::Disabled);

    // Destruction counts from adoption.
    clock.advance(Duration::hours(23));
    assert!(engine.rotate(&signer).await.unwrap().destroy_scheduled.is_empty());
    clock.advance(Duration::hours(1));
    assert_eq!(
        engine.rotate(&signer).await.unwrap().destroy_scheduled,
        vec![first]
    );
}

#[tokio::test]
async fn test_failure_on_one_key_does_not_stop_others() {
    let (_clock, backend, engine) = setup(&["a", "b", "c"]).await;
    backend.set_unavailable(&key("b"), true).await;

    let err = engine
        .rotate_configured(&[], &[RING.to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.failed_keys(), vec![key("b").as_str()]);
    assert!(matches!(
        err.failures[0].error,
        JvsError::RemoteService(BackendError::Unavailable(_))
    ));

    let mut ok = err.succeeded_keys();
    ok.sort();
    assert_eq!(ok, vec![key("a").as_str(), key("c").as_str()]);
    assert_single_enabled_primary(&engine, &key("a")).await;
    assert_single_enabled_primary(&engine, &key("c")).await;

    backend.set_unavailable(&key("b"), false).await;
    let outcomes = engine
        .rotate_configured(&[], &[RING.to_string()])
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert_single_enabled_primary(&engine, &key("b")).await;
}

#[tokio::test]
async fn test_unlistable_ring_is_reported() {
    let (_clock, backend, engine) = setup(&["a"]).await;
    backend.set_unavailable(RING, true).await;

    let err = engine
        .rotate_configured(&[key("a")], &[RING.to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.failed_keys(), vec![RING]);
    assert_eq!(err.succeeded_keys(), vec![key("a").as_str()]);
}

#[tokio::test]
async fn test_concurrent_rotation_of_same_key_keeps_single_primary() {
    let (_clock, _backend, engine) = setup(&["signer"]).await;
    let signer = key("signer");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let signer = signer.clone();
            tokio::spawn(async move { engine.rotate(&signer).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.promoted.is_some() => winners += 1,
            Ok(_) => {}
            Err(e) => assert!(
                matches!(e, JvsError::ConcurrentModification { .. }),
                "unexpected error {e}"
            ),
        }
    }

    assert_eq!(winners, 1);
    assert_single_enabled_primary(&engine, &signer).await;
}

/// Backend that lets another writer promote a version while a rotation is
/// validating its candidate.
struct RacingBackend {
    inner: Arc<SoftwareKmsBackend>,
    armed: AtomicBool,
}

#[async_trait]
impl SigningBackend for RacingBackend {
    async fn list_keys(&self, key_ring: &str) -> Result<Vec<String>, BackendError> {
        self.inner.list_keys(key_ring).await
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionRecord>, BackendError> {
        self.inner.list_versions(key).await
    }

    async fn get_version(&self, version: &str) -> Result<VersionRecord, BackendError> {
        self.inner.get_version(version).await
    }

    async fn create_version(
        &self,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<VersionRecord, BackendError> {
        self.inner.create_version(key, labels).await
    }

    async fn update_labels(
        &self,
        version: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        self.inner.update_labels(version, labels).await
    }

    async fn disable_version(&self, version: &str) -> Result<(), BackendError> {
        self.inner.disable_version(version).await
    }

    async fn destroy_version(&self, version: &str) -> Result<(), BackendError> {
        self.inner.destroy_version(version).await
    }

    async fn get_primary(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.get_primary(key).await
    }

    async fn swap_primary(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), BackendError> {
        self.inner.swap_primary(key, expected, new).await
    }

    async fn asymmetric_sign(&self, version: &str, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        self.inner.asymmetric_sign(version, data).await
    }

    async fn get_public_key(&self, version: &str) -> Result<PublicKeyPem, BackendError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let key = version
                .split_once("/cryptoKeyVersions/")
                .map(|(k, _)| k.to_string())
                .unwrap_or_default();
            let current = self.inner.get_primary(&key).await?;
            let rival = self
                .inner
                .create_version(&key, lifecycle_labels(LifecycleLabel::Primary, Utc::now()))
                .await?;
            self.inner
                .swap_primary(&key, current.as_deref(), Some(&rival.name))
                .await?;
        }
        self.inner.get_public_key(version).await
    }
}

#[tokio::test]
async fn test_promotion_aborts_when_primary_changes_underneath() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let inner = Arc::new(SoftwareKmsBackend::with_clock(clock.clone()));
    let signer = key("signer");
    inner.create_key(&signer, SigningAlgorithm::EcSignP256Sha256).await;
    let backend = Arc::new(RacingBackend {
        inner: inner.clone(),
        armed: AtomicBool::new(true),
    });
    let engine = RotationEngine::new(backend, policy()).with_clock(clock.clone());

    let err = engine.rotate(&signer).await.unwrap_err();
    assert!(matches!(err, JvsError::ConcurrentModification { .. }));
    assert!(err.is_retryable());

    // The rival stays primary; our candidate waits as NEW.
    assert_single_enabled_primary(&engine, &signer).await;
    let set = engine.load(&signer).await.unwrap();
    assert_eq!(set.versions.len(), 2);
    assert!(set.versions.iter().any(|v| v.label == LifecycleLabel::New));
}
