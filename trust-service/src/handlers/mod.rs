//! HTTP handlers for trust-service.

pub mod audit;
pub mod health;
pub mod impersonation;
pub mod metrics;
pub mod reauth;
pub mod sessions;

pub use health::health_check;
