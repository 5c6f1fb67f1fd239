pub mod settings;

pub use settings::{AppConfig, BackendConfig, CategoryRule, RotationConfig, RotationPolicyConfig};
