use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tower::{Layer, Service};
use tracing::{debug, warn};

use gatehouse_auth::{AuthzError, Requirement};
use gatehouse_infra::{AuthError, AuthService};

use crate::app::errors;
use crate::authz::Guard;
use crate::context::{PrincipalContext, RequestIdentity};

/// Name of the cookie carrying the signed token for browser clients.
pub const SESSION_COOKIE: &str = "gatehouse_token";

#[derive(Clone)]
pub struct AuthState {
    pub auth: Arc<AuthService>,
}

/// Resolve the caller and attach a [`RequestIdentity`].
///
/// Never rejects: a missing or dead credential continues anonymously and a
/// credential that could not be checked continues unresolved. Route guards
/// decide, so public routes such as logout keep working through a store
/// outage.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Response {
    let identity = match extract_token(req.headers()) {
        None => RequestIdentity::anonymous(),
        Some(token) => match state.auth.authenticate(token, Utc::now()).await {
            Ok(principal) => RequestIdentity::authenticated(principal),
            Err(AuthError::Authz(AuthzError::Unauthenticated)) => {
                debug!("credential did not resolve to a live session");
                RequestIdentity::anonymous()
            }
            Err(err) => {
                warn!(error = %err, "credential could not be checked");
                RequestIdentity::unresolved()
            }
        },
    };

    req.extensions_mut().insert(identity);
    next.run(req).await
}

/// Signed token from `Authorization: Bearer`, else from the session cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<&str> {
    extract_bearer(headers).or_else(|| extract_cookie(headers, SESSION_COOKIE))
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

/// Layer guarding every route it wraps with `requirement`.
///
/// Expects [`auth_middleware`] to have run. On success the handler sees a
/// [`PrincipalContext`] extension.
pub fn require(guard: &Guard, requirement: Requirement) -> RequireLayer {
    RequireLayer {
        guard: guard.clone(),
        requirement: Arc::new(requirement),
    }
}

#[derive(Clone)]
pub struct RequireLayer {
    guard: Guard,
    requirement: Arc<Requirement>,
}

impl<S> Layer<S> for RequireLayer {
    type Service = RequireService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireService {
            inner,
            guard: self.guard.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequireService<S> {
    inner: S,
    guard: Guard,
    requirement: Arc<Requirement>,
}

impl<S> Service<Request> for RequireService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        // The clone may not be ready; keep the one that was polled.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let guard = self.guard.clone();
        let requirement = self.requirement.clone();

        Box::pin(async move {
            let identity = req
                .extensions()
                .get::<RequestIdentity>()
                .cloned()
                .unwrap_or_default();

            match (guard.check(&identity, &requirement).await, identity.principal()) {
                (Ok(_), Some(principal)) => {
                    req.extensions_mut()
                        .insert(PrincipalContext::new(principal.clone()));
                    inner.call(req).await
                }
                (Ok(_), None) => Ok(errors::auth_error_to_response(AuthError::unauthenticated())),
                (Err(err), _) => Ok(errors::auth_error_to_response(err)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        headers.insert(header::COOKIE, HeaderValue::from_static("gatehouse_token=zzz"));
        assert_eq!(extract_token(&headers), Some("abc.def"));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; gatehouse_token=t0k3n; lang=en"),
        );
        assert_eq!(extract_token(&headers), Some("t0k3n"));
    }

    #[test]
    fn malformed_credentials_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        headers.insert(header::COOKIE, HeaderValue::from_static("gatehouse_token="));
        assert_eq!(extract_token(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer   "));
        assert_eq!(extract_token(&headers), None);
    }
}
