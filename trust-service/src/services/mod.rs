//! Services layer for the trust service.
//!
//! The four trust components live here alongside the storage seams they
//! depend on. Postgres and in-memory backends implement the same traits so
//! every component can be exercised without a database.

pub mod audit_chain;
pub mod classifier;
pub mod clock;
mod database;
pub mod error;
pub mod impersonation;
pub mod jwt;
mod memory;
pub mod metrics;
pub mod reauth;
pub mod redis;
pub mod session_registry;
pub mod store;
pub mod sweep;

pub use audit_chain::{AuditChain, ChainReport};
pub use classifier::Operation;
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use error::TrustError;
pub use impersonation::{ImpersonationGrant, ImpersonationManager, ImpersonationSettings};
pub use jwt::{AccessTokenClaims, ImpersonationClaims, TokenKind, TokenService};
pub use memory::InMemoryStore;
pub use reauth::{ReauthGate, SensitiveAction, StrongFactor};
pub use redis::{MemoryRevocationList, RedisService, RevocationList};
pub use session_registry::{DeviceSighting, SessionRegistry};
pub use store::{
    AuditStore, HealthProbe, ImpersonationStore, ReauthStore, SecurityPolicyStore, SessionStore,
    UserDirectory,
};
