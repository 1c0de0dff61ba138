pub mod audit;
pub mod impersonation;
pub mod session;

pub use audit::{AuditEntriesResponse, EntriesQuery, SearchQuery};
pub use impersonation::{
    EndImpersonationRequest, EndImpersonationResponse, ImpersonationSessionView,
    ImpersonationStatusResponse, LimitQuery, StartImpersonationRequest,
    StartImpersonationResponse,
};
pub use session::{
    ReauthStatusResponse, RevokeOthersResponse, RevokeSessionResponse, SessionListResponse,
};
