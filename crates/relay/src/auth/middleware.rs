//! Bearer authentication for the REST surface. Websocket connections
//! authenticate in-band with `hello` instead.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::jwt::{Identity, JwtIdentityService},
    error::{ErrorCode, RelayError},
};

/// Caller identity placed in request extensions by [`require_bearer_auth`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub display_name: String,
}

impl From<Identity> for AuthenticatedUser {
    fn from(identity: Identity) -> Self {
        Self { user_id: identity.user_id, display_name: identity.display_name }
    }
}

pub async fn require_bearer_auth(
    State(identity): State<Arc<JwtIdentityService>>,
    mut request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let user = authenticate(&identity, request.headers())?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn authenticate(
    identity: &JwtIdentityService,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, RelayError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| RelayError::new(ErrorCode::Unauthenticated, "missing bearer token"))?;

    identity.verify(token).map(AuthenticatedUser::from).map_err(|error| {
        debug!(error = %error, "rejected bearer token");
        RelayError::new(ErrorCode::Unauthenticated, "invalid bearer token")
    })
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty()).then_some(token)
}
