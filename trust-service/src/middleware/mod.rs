pub mod admin;
pub mod auth;
pub mod reauth;
pub mod tenant;

pub use admin::require_admin;
pub use auth::{auth_middleware, AuthUser, Impersonation};
pub use reauth::require_recent_reauth;
pub use tenant::tenant_scope_middleware;
