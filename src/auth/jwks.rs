//! Public key discovery in JWK Set form.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use crate::certs::backend::{PublicKeyPem, SigningAlgorithm};
use crate::certs::rotation::RotationEngine;
use crate::error::{JvsError, KeyFailure};

/// One EC public key in JWK form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
}

impl Jwk {
    pub fn from_public_key(kid: &str, public_key: &PublicKeyPem) -> Result<Self, JvsError> {
        let algorithm = public_key.algorithm;
        let point = ec_point_from_pem(&public_key.pem, algorithm)?;
        let (x, y) = point[1..].split_at(algorithm.coordinate_len());

        Ok(Self {
            kty: "EC".to_string(),
            crv: algorithm.curve_name().to_string(),
            x: URL_SAFE_NO_PAD.encode(x),
            y: URL_SAFE_NO_PAD.encode(y),
            kid: kid.to_string(),
            key_use: "sig".to_string(),
            alg: format!("{:?}", algorithm.jwt_algorithm()),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// Extracts the uncompressed EC point (`0x04 || X || Y`) from a PEM
/// SubjectPublicKeyInfo and checks it matches `algorithm`'s curve.
pub fn ec_point_from_pem(pem: &str, algorithm: SigningAlgorithm) -> Result<Vec<u8>, JvsError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| JvsError::Signing(format!("Failed to parse public key PEM: {:?}", e)))?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(&pem.contents)
        .map_err(|e| JvsError::Signing(format!("Failed to parse public key: {:?}", e)))?;

    let point = spki.subject_public_key.as_ref().to_vec();
    let expected = 1 + 2 * algorithm.coordinate_len();
    if point.len() != expected || point[0] != 0x04 {
        return Err(JvsError::Signing(format!(
            "public key is not an uncompressed {} point",
            algorithm.curve_name()
        )));
    }
    Ok(point)
}

/// Publishes the public keys of every enabled version across the configured
/// keys and key rings.
pub struct PublicKeyDiscovery {
    engine: Arc<RotationEngine>,
    key_names: Vec<String>,
    key_rings: Vec<String>,
}

impl PublicKeyDiscovery {
    pub fn new(
        engine: Arc<RotationEngine>,
        key_names: Vec<String>,
        key_rings: Vec<String>,
    ) -> Self {
        Self {
            engine,
            key_names,
            key_rings,
        }
    }

    /// Builds the set from every key that can be read. Keys, rings or
    /// versions that fail are logged and left out; the call fails only when
    /// failures left nothing to publish.
    pub async fn jwks(&self) -> Result<JwkSet, JvsError> {
        let (keys, mut failures) = self
            .engine
            .resolve_keys(&self.key_names, &self.key_rings)
            .await;

        let mut set = JwkSet::default();
        for key in &keys {
            match self.key_jwks(key).await {
                Ok(jwks) => set.keys.extend(jwks),
                Err(error) => {
                    warn!(key = %key, error = %error, "Leaving key out of JWK set");
                    failures.push(KeyFailure {
                        key: key.clone(),
                        error,
                    });
                }
            }
        }

        debug!(
            keys = keys.len(),
            versions = set.keys.len(),
            failed = failures.len(),
            "Built JWK set"
        );
        match failures.into_iter().next() {
            Some(failure) if set.keys.is_empty() => Err(failure.error),
            _ => Ok(set),
        }
    }

    async fn key_jwks(&self, key: &str) -> Result<Vec<Jwk>, JvsError> {
        let mut jwks = Vec::new();
        for version in self.engine.enabled_versions(key).await? {
            // A version disabled since listing is simply no longer published.
            let public_key = match self
                .engine
                .call(self.engine.backend().get_public_key(&version.id))
                .await
            {
                Ok(public_key) => public_key,
                Err(e) => {
                    warn!(version = %version.id, error = %e, "Skipping unreadable public key");
                    continue;
                }
            };
            jwks.push(Jwk::from_public_key(&version.id, &public_key)?);
        }
        Ok(jwks)
    }
}
