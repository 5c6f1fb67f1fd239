use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::Algorithm;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::lifecycle::{BackendState, Clock, SystemClock};
use crate::error::BackendError;
use crate::models::BackendConfig;

const VERSION_SEPARATOR: &str = "/cryptoKeyVersions/";
const KEY_SEPARATOR: &str = "/cryptoKeys/";

/// Asymmetric signing algorithm of a key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SigningAlgorithm {
    EcSignP256Sha256,
    EcSignP384Sha384,
}

impl SigningAlgorithm {
    /// Byte length of one curve coordinate, and of each of R and S.
    pub fn coordinate_len(&self) -> usize {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => 32,
            SigningAlgorithm::EcSignP384Sha384 => 48,
        }
    }

    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => Algorithm::ES256,
            SigningAlgorithm::EcSignP384Sha384 => Algorithm::ES384,
        }
    }

    /// JWK `crv` name.
    pub fn curve_name(&self) -> &'static str {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => "P-256",
            SigningAlgorithm::EcSignP384Sha384 => "P-384",
        }
    }

    /// ring algorithm producing ASN.1/DER signatures, as a KMS does.
    pub fn der_signing(&self) -> &'static signature::EcdsaSigningAlgorithm {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            SigningAlgorithm::EcSignP384Sha384 => &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
        }
    }

    /// ring algorithm verifying fixed-width `R||S` signatures.
    pub fn fixed_verification(&self) -> &'static signature::EcdsaVerificationAlgorithm {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => &signature::ECDSA_P256_SHA256_FIXED,
            SigningAlgorithm::EcSignP384Sha384 => &signature::ECDSA_P384_SHA384_FIXED,
        }
    }

    fn rcgen_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            SigningAlgorithm::EcSignP256Sha256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            SigningAlgorithm::EcSignP384Sha384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

/// A version as the backend reports it. Labels are raw strings here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub name: String,
    pub key: String,
    pub create_time: DateTime<Utc>,
    pub state: BackendState,
    pub algorithm: SigningAlgorithm,
    pub labels: HashMap<String, String>,
}

/// PEM-encoded SubjectPublicKeyInfo of a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPem {
    pub pem: String,
    pub algorithm: SigningAlgorithm,
}

/// Remote KMS capability: version registry, signing and public key export.
///
/// The backend never hands out private key material. Every mutating call
/// targets one version or one key's primary pointer.
#[async_trait]
pub trait SigningBackend: Send + Sync {
    /// Names of all keys under a key ring.
    async fn list_keys(&self, key_ring: &str) -> Result<Vec<String>, BackendError>;

    /// All versions of `key` that are not yet destroyed.
    async fn list_versions(&self, key: &str) -> Result<Vec<VersionRecord>, BackendError>;

    async fn get_version(&self, version: &str) -> Result<VersionRecord, BackendError>;

    /// Creates an enabled version carrying `labels`.
    async fn create_version(
        &self,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<VersionRecord, BackendError>;

    /// Merges `labels` into the version's labels.
    async fn update_labels(
        &self,
        version: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), BackendError>;

    async fn disable_version(&self, version: &str) -> Result<(), BackendError>;

    /// Schedules a disabled version for destruction.
    async fn destroy_version(&self, version: &str) -> Result<(), BackendError>;

    /// The key-level primary pointer.
    async fn get_primary(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Compare-and-swap of the primary pointer. Fails with
    /// [`BackendError::Aborted`] when the pointer is not `expected`.
    async fn swap_primary(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), BackendError>;

    /// Signs `data` and returns the DER-encoded ECDSA signature.
    async fn asymmetric_sign(&self, version: &str, data: &[u8]) -> Result<Vec<u8>, BackendError>;

    async fn get_public_key(&self, version: &str) -> Result<PublicKeyPem, BackendError>;
}

/// Key name a version belongs to.
pub fn parent_key(version: &str) -> Option<&str> {
    version.split_once(VERSION_SEPARATOR).map(|(key, _)| key)
}

struct SoftwareVersion {
    record: VersionRecord,
    key_pair: EcdsaKeyPair,
    public_pem: String,
    destroy_scheduled_at: Option<DateTime<Utc>>,
}

struct SoftwareKey {
    algorithm: SigningAlgorithm,
    primary: Option<String>,
    next_version: u64,
    versions: BTreeMap<u64, SoftwareVersion>,
}

/// In-process KMS stand-in. Generates real EC key pairs and signs with them,
/// returning DER signatures and PEM public keys exactly like a remote KMS.
pub struct SoftwareKmsBackend {
    keys: Arc<RwLock<HashMap<String, SoftwareKey>>>,
    unavailable: Arc<RwLock<HashSet<String>>>,
    clock: Arc<dyn Clock>,
    rng: SystemRandom,
    destroy_grace: Duration,
    mutations: AtomicU64,
}

impl SoftwareKmsBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Arc::new(RwLock::new(HashMap::new())),
            unavailable: Arc::new(RwLock::new(HashSet::new())),
            clock,
            rng: SystemRandom::new(),
            destroy_grace: Duration::hours(24),
            mutations: AtomicU64::new(0),
        }
    }

    /// How long a scheduled version lingers before it is destroyed.
    pub fn with_destroy_grace(mut self, grace: Duration) -> Self {
        self.destroy_grace = grace;
        self
    }

    /// Registers an empty key. Keys are provisioned out of band on a real KMS.
    pub async fn create_key(&self, key: &str, algorithm: SigningAlgorithm) {
        let mut keys = self.keys.write().await;
        keys.entry(key.to_string()).or_insert_with(|| {
            info!(key = %key, ?algorithm, "Provisioned software key");
            SoftwareKey {
                algorithm,
                primary: None,
                next_version: 1,
                versions: BTreeMap::new(),
            }
        });
    }

    /// Makes every call touching `key` fail with `Unavailable`.
    pub async fn set_unavailable(&self, key: &str, unavailable: bool) {
        let mut set = self.unavailable.write().await;
        if unavailable {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    /// Number of state-changing calls served so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    async fn check_available(&self, key: &str) -> Result<(), BackendError> {
        if self.unavailable.read().await.contains(key) {
            return Err(BackendError::Unavailable(format!("{key} is unreachable")));
        }
        Ok(())
    }

    fn split_version(version: &str) -> Result<(&str, u64), BackendError> {
        let (key, number) = version
            .split_once(VERSION_SEPARATOR)
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        let number = number
            .parse::<u64>()
            .map_err(|_| BackendError::NotFound(version.to_string()))?;
        Ok((key, number))
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn settle(&self, version: &mut SoftwareVersion, now: DateTime<Utc>) {
        if let Some(at) = version.destroy_scheduled_at
            && version.record.state == BackendState::ScheduledForDestruction
            && now - at >= self.destroy_grace
        {
            version.record.state = BackendState::Destroyed;
        }
    }

    fn generate(
        &self,
        algorithm: SigningAlgorithm,
    ) -> Result<(EcdsaKeyPair, String), BackendError> {
        let generated = rcgen::KeyPair::generate_for(algorithm.rcgen_algorithm())
            .map_err(|e| BackendError::Crypto(format!("key generation failed: {e}")))?;
        let key_pair =
            EcdsaKeyPair::from_pkcs8(algorithm.der_signing(), &generated.serialize_der(), &self.rng)
                .map_err(|e| BackendError::Crypto(format!("key rejected: {e}")))?;
        Ok((key_pair, generated.public_key_pem()))
    }
}

impl Default for SoftwareKmsBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningBackend for SoftwareKmsBackend {
    async fn list_keys(&self, key_ring: &str) -> Result<Vec<String>, BackendError> {
        self.check_available(key_ring).await?;
        let prefix = format!("{key_ring}{KEY_SEPARATOR}");
        let keys = self.keys.read().await;
        let mut names: Vec<String> = keys
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_versions(&self, key: &str) -> Result<Vec<VersionRecord>, BackendError> {
        self.check_available(key).await?;
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

        let mut records = Vec::new();
        for version in entry.versions.values_mut() {
            self.settle(version, now);
            if version.record.state != BackendState::Destroyed {
                records.push(version.record.clone());
            }
        }
        Ok(records)
    }

    async fn get_version(&self, version: &str) -> Result<VersionRecord, BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let v = keys
            .get_mut(key)
            .and_then(|k| k.versions.get_mut(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        self.settle(v, now);
        Ok(v.record.clone())
    }

    async fn create_version(
        &self,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<VersionRecord, BackendError> {
        self.check_available(key).await?;
        let algorithm = {
            let keys = self.keys.read().await;
            keys.get(key)
                .map(|k| k.algorithm)
                .ok_or_else(|| BackendError::NotFound(key.to_string()))?
        };

        let (key_pair, public_pem) = self.generate(algorithm)?;

        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let number = entry.next_version;
        entry.next_version += 1;

        let record = VersionRecord {
            name: format!("{key}{VERSION_SEPARATOR}{number}"),
            key: key.to_string(),
            create_time: self.clock.now(),
            state: BackendState::Enabled,
            algorithm,
            labels,
        };
        entry.versions.insert(
            number,
            SoftwareVersion {
                record: record.clone(),
                key_pair,
                public_pem,
                destroy_scheduled_at: None,
            },
        );
        self.bump();

        debug!(version = %record.name, "Created software key version");
        Ok(record)
    }

    async fn update_labels(
        &self,
        version: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let mut keys = self.keys.write().await;
        let v = keys
            .get_mut(key)
            .and_then(|k| k.versions.get_mut(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        v.record.labels.extend(labels);
        self.bump();
        Ok(())
    }

    async fn disable_version(&self, version: &str) -> Result<(), BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let mut keys = self.keys.write().await;
        let v = keys
            .get_mut(key)
            .and_then(|k| k.versions.get_mut(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        if v.record.state != BackendState::Enabled {
            return Err(BackendError::FailedPrecondition(format!(
                "{version} is {}",
                v.record.state
            )));
        }
        v.record.state = BackendState::Disabled;
        self.bump();
        Ok(())
    }

    async fn destroy_version(&self, version: &str) -> Result<(), BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let now = self.clock.now();
        let mut keys = self.keys.write().await;
        let v = keys
            .get_mut(key)
            .and_then(|k| k.versions.get_mut(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        if v.record.state != BackendState::Disabled {
            return Err(BackendError::FailedPrecondition(format!(
                "{version} is {}",
                v.record.state
            )));
        }
        v.record.state = BackendState::ScheduledForDestruction;
        v.destroy_scheduled_at = Some(now);
        self.bump();
        Ok(())
    }

    async fn get_primary(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.check_available(key).await?;
        let keys = self.keys.read().await;
        keys.get(key)
            .map(|k| k.primary.clone())
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn swap_primary(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<(), BackendError> {
        self.check_available(key).await?;
        let mut keys = self.keys.write().await;
        let entry = keys
            .get_mut(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;

        if entry.primary.as_deref() != expected {
            return Err(BackendError::Aborted(format!(
                "primary of {key} is {:?}, expected {:?}",
                entry.primary, expected
            )));
        }

        if let Some(new) = new {
            let (_, number) = Self::split_version(new)?;
            let enabled = entry
                .versions
                .get(&number)
                .is_some_and(|v| v.record.state == BackendState::Enabled);
            if !enabled {
                return Err(BackendError::FailedPrecondition(format!(
                    "{new} is not an enabled version of {key}"
                )));
            }
        }

        entry.primary = new.map(str::to_string);
        self.bump();
        Ok(())
    }

    async fn asymmetric_sign(&self, version: &str, data: &[u8]) -> Result<Vec<u8>, BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let keys = self.keys.read().await;
        let v = keys
            .get(key)
            .and_then(|k| k.versions.get(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        if v.record.state != BackendState::Enabled {
            return Err(BackendError::FailedPrecondition(format!(
                "{version} is {}",
                v.record.state
            )));
        }

        let sig = v
            .key_pair
            .sign(&self.rng, data)
            .map_err(|_| BackendError::Crypto(format!("signing with {version} failed")))?;
        Ok(sig.as_ref().to_vec())
    }

    async fn get_public_key(&self, version: &str) -> Result<PublicKeyPem, BackendError> {
        let (key, number) = Self::split_version(version)?;
        self.check_available(key).await?;
        let keys = self.keys.read().await;
        let v = keys
            .get(key)
            .and_then(|k| k.versions.get(&number))
            .ok_or_else(|| BackendError::NotFound(version.to_string()))?;
        if v.record.state != BackendState::Enabled {
            return Err(BackendError::FailedPrecondition(format!(
                "{version} is {}",
                v.record.state
            )));
        }
        Ok(PublicKeyPem {
            pem: v.public_pem.clone(),
            algorithm: v.record.algorithm,
        })
    }
}

/// Builds the configured backend and provisions the keys it must serve.
pub async fn create_backend(
    config: &BackendConfig,
    keys: &[String],
) -> Result<Arc<dyn SigningBackend>, String> {
    match config {
        BackendConfig::Software { algorithm } => {
            let backend = SoftwareKmsBackend::new();
            for key in keys {
                backend.create_key(key, *algorithm).await;
            }
            Ok(Arc::new(backend))
        }
    }
}
