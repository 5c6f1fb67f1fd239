pub mod actions;
pub mod backend;
pub mod lifecycle;
pub mod rotation;

pub use actions::{CertificateActionOutcome, CertificateActionService};
pub use backend::{
    PublicKeyPem, SigningAlgorithm, SigningBackend, SoftwareKmsBackend, create_backend,
};
pub use lifecycle::{
    BackendState, Clock, KeyVersion, LifecycleLabel, ManualClock, RotationPolicy, SystemClock,
    VersionSet,
};
pub use rotation::{RotationEngine, RotationOutcome, RotationScheduler};
