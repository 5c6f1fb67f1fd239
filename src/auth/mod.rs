pub mod justification;
pub mod jwks;
pub mod jwt;
pub mod signature;
pub mod verifier;

pub use justification::{Justification, JustificationRequest, JustificationValidator};
pub use jwks::{Jwk, JwkSet, PublicKeyDiscovery};
pub use jwt::{JustificationClaims, SigningPipeline};
pub use signature::{der_to_fixed, fixed_to_der};
pub use verifier::VerificationUtility;
