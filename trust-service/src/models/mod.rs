pub mod audit_entry;
pub mod auth_session;
pub mod impersonation_session;
pub mod org_security_settings;
pub mod principal;
pub mod reauth_state;
pub mod tenant;
pub mod user;

pub use audit_entry::{AuditAction, AuditActor, AuditDraft, AuditEntry, SYSTEM_ACTOR_ID};
pub use auth_session::{AuthSession, SessionInfo};
pub use impersonation_session::{ImpersonationSession, ImpersonationStatus};
pub use org_security_settings::OrgSecuritySettings;
pub use principal::{Principal, Role};
pub use reauth_state::ReauthState;
pub use tenant::TenantContext;
pub use user::UserRecord;
