use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use std::sync::Arc;
use tracing::{debug, warn};

use super::jwks::ec_point_from_pem;
use super::jwt::JustificationClaims;
use crate::certs::lifecycle::KeyVersion;
use crate::certs::rotation::RotationEngine;
use crate::error::JvsError;
use crate::metrics;

/// Allowed clock skew when checking `exp` and `nbf`.
pub const CLOCK_SKEW_SECS: i64 = 30;

/// Verifies tokens against every enabled version of a key, so tokens signed
/// by a just-demoted version keep verifying while it propagates.
pub struct VerificationUtility {
    engine: Arc<RotationEngine>,
    issuer: String,
    audiences: Vec<String>,
}

impl VerificationUtility {
    pub fn new(
        engine: Arc<RotationEngine>,
        issuer: impl Into<String>,
        audiences: Vec<String>,
    ) -> Self {
        Self {
            engine,
            issuer: issuer.into(),
            audiences,
        }
    }

    pub async fn verify_token(
        &self,
        key: &str,
        token: &str,
    ) -> Result<JustificationClaims, JvsError> {
        let result = self.verify(key, token).await;
        metrics::record_token_verified(match &result {
            Ok(_) => "valid",
            Err(JvsError::SignatureInvalid) => "signature_invalid",
            Err(JvsError::InvalidToken(_)) => "invalid_token",
            Err(_) => "error",
        });
        result
    }

    async fn verify(&self, key: &str, token: &str) -> Result<JustificationClaims, JvsError> {
        let header = decode_header(token).map_err(|e| JvsError::InvalidToken(e.to_string()))?;

        let mut candidates = self.engine.enabled_versions(key).await?;
        if candidates.is_empty() {
            return Err(JvsError::KeyUnavailable {
                key: key.to_string(),
            });
        }
        candidates.retain(|v| v.algorithm.jwt_algorithm() == header.alg);
        if candidates.is_empty() {
            return Err(JvsError::InvalidToken(format!(
                "unsupported alg {:?}",
                header.alg
            )));
        }
        if let Some(kid) = &header.kid
            && let Some(pos) = candidates.iter().position(|v| &v.id == kid)
        {
            let hinted = candidates.remove(pos);
            candidates.insert(0, hinted);
        }

        let mut resolved = 0usize;
        for version in &candidates {
            let decoding_key = match self.decoding_key(version).await {
                Ok(k) => k,
                Err(e) => {
                    warn!(
                        version = %version.id,
                        error = %e,
                        "Skipping unresolvable verification key"
                    );
                    continue;
                }
            };
            resolved += 1;

            match decode::<JustificationClaims>(token, &decoding_key, &self.validation(version)) {
                Ok(data) => {
                    self.check_times(&data.claims)?;
                    debug!(version = %version.id, jti = %data.claims.jti, "Token verified");
                    return Ok(data.claims);
                }
                Err(e) if matches!(e.kind(), ErrorKind::InvalidSignature) => continue,
                Err(e) => return Err(JvsError::InvalidToken(e.to_string())),
            }
        }

        if resolved == 0 {
            return Err(JvsError::KeyUnavailable {
                key: key.to_string(),
            });
        }
        Err(JvsError::SignatureInvalid)
    }

    async fn decoding_key(&self, version: &KeyVersion) -> Result<DecodingKey, JvsError> {
        let public_key = self
            .engine
            .call(self.engine.backend().get_public_key(&version.id))
            .await?;
        let point = ec_point_from_pem(&public_key.pem, version.algorithm)?;
        Ok(DecodingKey::from_ec_der(&point))
    }

    fn validation(&self, version: &KeyVersion) -> Validation {
        let mut validation = Validation::new(version.algorithm.jwt_algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&self.audiences);
        validation.set_required_spec_claims(&["exp", "nbf", "iss", "aud"]);
        // Time claims are checked against the engine clock.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation
    }

    fn check_times(&self, claims: &JustificationClaims) -> Result<(), JvsError> {
        let now = self.engine.now().timestamp();
        if now >= claims.exp + CLOCK_SKEW_SECS {
            return Err(JvsError::InvalidToken("token expired".to_string()));
        }
        if now + CLOCK_SKEW_SECS < claims.nbf {
            return Err(JvsError::InvalidToken("token not yet valid".to_string()));
        }
        Ok(())
    }
}
