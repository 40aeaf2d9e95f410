use axum::http::{HeaderMap, header};

use gatehouse_auth::{Principal, SessionOrigin};
use gatehouse_core::UserId;

/// Who is calling, as resolved by the auth middleware.
///
/// Present on every request that passed through the middleware. Anonymous
/// when no credential was sent or the credential no longer maps to a live
/// session; guards turn that into `401`. Unresolved when the credential could
/// not be checked at all; guards turn that into `500` while public routes
/// carry on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    principal: Option<Principal>,
    unresolved: bool,
}

impl RequestIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
            unresolved: false,
        }
    }

    pub fn unresolved() -> Self {
        Self {
            principal: None,
            unresolved: true,
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.principal.as_ref().map(|p| p.user_id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn is_unresolved(&self) -> bool {
        self.unresolved
    }
}

/// Identity that already passed a route guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal: Principal,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}

/// Client address and user agent recorded on a new session.
///
/// The address comes from the first `X-Forwarded-For` hop, falling back to
/// `X-Real-IP`; deployments without a proxy record none.
pub fn session_origin(headers: &HeaderMap) -> SessionOrigin {
    let ip_address = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(str::to_string);

    let user_agent = header_str(headers, header::USER_AGENT.as_str())
        .map(|v| v.chars().take(512).collect());

    SessionOrigin {
        ip_address,
        user_agent,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
