use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::Header;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use super::justification::{Justification, JustificationRequest, JustificationValidator};
use super::signature::der_to_fixed;
use crate::audit::AuditLogger;
use crate::certs::rotation::RotationEngine;
use crate::error::JvsError;
use crate::metrics;

/// Claims carried by a justification token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JustificationClaims {
    pub iss: String,
    #[serde(default)]
    pub sub: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    /// The request's justifications, in request order.
    pub justs: Vec<Justification>,
}

/// Validates justification requests and mints tokens signed by the primary
/// version of the configured signing key.
pub struct SigningPipeline {
    engine: Arc<RotationEngine>,
    signing_key: String,
    issuer: String,
    audiences: Vec<String>,
    validator: JustificationValidator,
    audit: Option<Arc<AuditLogger>>,
}

impl SigningPipeline {
    pub fn new(
        engine: Arc<RotationEngine>,
        signing_key: impl Into<String>,
        issuer: impl Into<String>,
        audiences: Vec<String>,
        validator: JustificationValidator,
    ) -> Self {
        Self {
            engine,
            signing_key: signing_key.into(),
            issuer: issuer.into(),
            audiences,
            validator,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn signing_key(&self) -> &str {
        &self.signing_key
    }

    /// Issues a compact JWS for `request`. Nothing is signed unless the whole
    /// request validates.
    pub async fn create_token(&self, request: &JustificationRequest) -> Result<String, JvsError> {
        let ttl = self.validator.validate(request)?;

        let primary = self.engine.get_primary(&self.signing_key).await?;
        let algorithm = primary.algorithm;

        let now = self.engine.now().timestamp();
        let claims = JustificationClaims {
            iss: self.issuer.clone(),
            sub: request.subject.clone().unwrap_or_default(),
            aud: request
                .audiences
                .clone()
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| self.audiences.clone()),
            iat: now,
            nbf: now,
            exp: now + ttl.num_seconds(),
            jti: uuid::Uuid::new_v4().to_string(),
            justs: request.justifications.clone(),
        };

        let mut header = Header::new(algorithm.jwt_algorithm());
        header.kid = Some(primary.id.clone());

        let signing_input = format!("{}.{}", encode_segment(&header)?, encode_segment(&claims)?);

        let started = Instant::now();
        let der = self
            .engine
            .call(
                self.engine
                    .backend()
                    .asymmetric_sign(&primary.id, signing_input.as_bytes()),
            )
            .await
            .inspect_err(|e| error!(version = %primary.id, error = %e, "Backend signing failed"))?;
        metrics::record_signing_duration(started.elapsed().as_secs_f64());

        let signature = der_to_fixed(&der, algorithm.coordinate_len())?;
        let token = format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature));

        info!(
            jti = %claims.jti,
            kid = %primary.id,
            ttl_secs = ttl.num_seconds(),
            "Issued justification token"
        );
        metrics::record_token_issued(&self.signing_key);
        if let Some(audit) = &self.audit {
            let categories: Vec<String> =
                claims.justs.iter().map(|j| j.category.clone()).collect();
            audit
                .log_token_issued(&claims.jti, request.subject.as_deref(), &primary.id, &categories)
                .await;
        }

        Ok(token)
    }
}

fn encode_segment<T: Serialize>(value: &T) -> Result<String, JvsError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| JvsError::Internal(format!("failed to serialize token segment: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}
