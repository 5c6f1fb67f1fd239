// Library exports for the binary and integration tests
pub mod audit;
pub mod auth;
pub mod certs;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod models;
