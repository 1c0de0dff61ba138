//! Maps an HTTP request to a coarse operation tag for impersonation policy.

use once_cell::sync::Lazy;
use regex::Regex;
use service_core::axum::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PasswordChange,
    MfaReset,
    PasskeyManage,
    UserDelete,
    RoleUpdate,
    PaymentMethodUpdate,
    SessionRevoke,
    ImpersonationStart,
    OrgSecurityUpdate,
    DataExport,
    AccountErase,
    ProfileUpdate,
    DocumentUpload,
    Read,
    /// Unmatched request with a safe verb.
    Other,
    /// Unmatched request with a mutating verb.
    OtherMutation,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PasswordChange => "password.change",
            Operation::MfaReset => "mfa.reset",
            Operation::PasskeyManage => "passkey.manage",
            Operation::UserDelete => "user.delete",
            Operation::RoleUpdate => "role.update",
            Operation::PaymentMethodUpdate => "payment.method.update",
            Operation::SessionRevoke => "session.revoke",
            Operation::ImpersonationStart => "impersonation.start",
            Operation::OrgSecurityUpdate => "org.security.update",
            Operation::DataExport => "data.export",
            Operation::AccountErase => "account.erase",
            Operation::ProfileUpdate => "profile.update",
            Operation::DocumentUpload => "document.upload",
            Operation::Read => "read",
            Operation::Other => "other",
            Operation::OtherMutation => "other.mutation",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations an impersonation grant never permits unless customised.
pub const DEFAULT_DENY: [Operation; 11] = [
    Operation::PasswordChange,
    Operation::MfaReset,
    Operation::PasskeyManage,
    Operation::UserDelete,
    Operation::RoleUpdate,
    Operation::PaymentMethodUpdate,
    Operation::SessionRevoke,
    Operation::ImpersonationStart,
    Operation::OrgSecurityUpdate,
    Operation::DataExport,
    Operation::AccountErase,
];

pub fn default_deny_list() -> Vec<String> {
    DEFAULT_DENY.iter().map(|op| op.as_str().to_string()).collect()
}

struct Rule {
    methods: &'static [Method],
    pattern: Regex,
    operation: Operation,
}

const MUTATING: &[Method] = &[Method::POST, Method::PUT, Method::PATCH, Method::DELETE];
const WRITE: &[Method] = &[Method::POST, Method::PUT, Method::PATCH];
const DELETE: &[Method] = &[Method::DELETE];
const SAFE: &[Method] = &[Method::GET, Method::HEAD, Method::OPTIONS];
const READ_OR_CREATE: &[Method] = &[Method::GET, Method::POST];
const UPDATE: &[Method] = &[Method::PUT, Method::PATCH];
const UPLOAD: &[Method] = &[Method::POST, Method::PUT];

fn rule(methods: &'static [Method], pattern: &str, operation: Operation) -> Option<Rule> {
    match Regex::new(pattern) {
        Ok(pattern) => Some(Rule {
            methods,
            pattern,
            operation,
        }),
        Err(e) => {
            tracing::error!(pattern, error = %e, "Invalid classifier pattern skipped");
            None
        }
    }
}

/// First match wins, so specific rules precede general ones.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    [
        rule(WRITE, r"^/(api/)?(users/[^/]+|me|account)/password/?$", Operation::PasswordChange),
        rule(WRITE, r"^/(api/)?auth/password(/.*)?$", Operation::PasswordChange),
        rule(MUTATING, r"^/(api/)?(users/[^/]+/|me/|auth/)?(mfa|totp)(/.*)?$", Operation::MfaReset),
        rule(MUTATING, r"^/(api/)?(users/[^/]+/|me/|auth/)?(passkeys?|webauthn)(/.*)?$", Operation::PasskeyManage),
        rule(MUTATING, r"^/(api/)?(users/[^/]+|me)/roles?(/.*)?$", Operation::RoleUpdate),
        rule(MUTATING, r"^/(api/)?(orgs?/[^/]+/)?members/[^/]+/roles?(/.*)?$", Operation::RoleUpdate),
        rule(MUTATING, r"^/(api/)?(billing/)?payment-methods?(/.*)?$", Operation::PaymentMethodUpdate),
        rule(MUTATING, r"^/(api/)?sessions(/.*)?$", Operation::SessionRevoke),
        rule(MUTATING, r"^/(api/)?impersonation/start/?$", Operation::ImpersonationStart),
        rule(MUTATING, r"^/(api/)?(orgs?/[^/]+/)?security(-settings)?(/.*)?$", Operation::OrgSecurityUpdate),
        rule(MUTATING, r"^/(api/)?(account|me|gdpr)/erase/?$", Operation::AccountErase),
        rule(DELETE, r"^/(api/)?(account|me)/?$", Operation::AccountErase),
        rule(DELETE, r"^/(api/)?users/[^/]+/?$", Operation::UserDelete),
        rule(READ_OR_CREATE, r"^/(api/)?(exports?|gdpr/export|data/export|audit/export)(/.*)?$", Operation::DataExport),
        rule(WRITE, r"^/(api/)?(users/[^/]+|me)/profile/?$", Operation::ProfileUpdate),
        rule(UPDATE, r"^/(api/)?(users/[^/]+|me)/?$", Operation::ProfileUpdate),
        rule(UPLOAD, r"^/(api/)?documents(/[^/]+)?/?(upload)?/?$", Operation::DocumentUpload),
        rule(SAFE, r"^/(api/)?(me|users|documents|dashboard|sessions|impersonation|reauth)(/.*)?$", Operation::Read),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Classifies a request by method and path; the query string is ignored.
pub fn classify(method: &Method, path: &str) -> Operation {
    let path = path.split('?').next().unwrap_or(path);

    RULES
        .iter()
        .find(|rule| rule.methods.contains(method) && rule.pattern.is_match(path))
        .map(|rule| rule.operation)
        .unwrap_or_else(|| {
            if MUTATING.contains(method) {
                Operation::OtherMutation
            } else {
                Operation::Other
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_risk_routes_classify_into_the_deny_set() {
        let cases = [
            (Method::POST, "/users/42/password", Operation::PasswordChange),
            (Method::POST, "/auth/password/change", Operation::PasswordChange),
            (Method::DELETE, "/me/mfa", Operation::MfaReset),
            (Method::POST, "/auth/passkeys/register", Operation::PasskeyManage),
            (Method::DELETE, "/users/42", Operation::UserDelete),
            (Method::PUT, "/users/42/role", Operation::RoleUpdate),
            (Method::POST, "/billing/payment-methods", Operation::PaymentMethodUpdate),
            (Method::DELETE, "/sessions/abc", Operation::SessionRevoke),
            (Method::POST, "/sessions/revoke-others", Operation::SessionRevoke),
            (Method::POST, "/impersonation/start", Operation::ImpersonationStart),
            (Method::PATCH, "/orgs/7/security", Operation::OrgSecurityUpdate),
            (Method::GET, "/gdpr/export", Operation::DataExport),
            (Method::POST, "/account/erase", Operation::AccountErase),
        ];

        for (method, path, expected) in cases {
            let op = classify(&method, path);
            assert_eq!(op, expected, "{} {}", method, path);
            assert!(DEFAULT_DENY.contains(&op), "{} should be denied", op);
        }
    }

    #[test]
    fn ordinary_routes_classify_as_allowed() {
        assert_eq!(classify(&Method::GET, "/users/42"), Operation::Read);
        assert_eq!(classify(&Method::PATCH, "/me"), Operation::ProfileUpdate);
        assert_eq!(classify(&Method::POST, "/documents/upload"), Operation::DocumentUpload);
        assert_eq!(classify(&Method::GET, "/sessions"), Operation::Read);
    }

    #[test]
    fn unmatched_mutations_are_distinguished_from_reads() {
        assert_eq!(classify(&Method::POST, "/recipes"), Operation::OtherMutation);
        assert_eq!(classify(&Method::GET, "/recipes?page=2"), Operation::Other);
        assert_eq!(classify(&Method::TRACE, "/recipes"), Operation::Other);
    }

    #[test]
    fn every_rule_compiles() {
        assert_eq!(RULES.len(), 18);
    }

    #[test]
    fn default_deny_list_is_stable() {
        let list = default_deny_list();
        assert_eq!(list.len(), 11);
        assert!(list.contains(&"user.delete".to_string()));
        assert!(!list.contains(&"read".to_string()));
    }
}
