use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::ApiError;
use super::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    /// Admins and operators may mutate flags; every role may read.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::Operator => write!(f, "operator"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// The authenticated caller, attached to the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub token: String,
    pub role: Role,
}

/// Extract bearer token from Authorization header value.
pub fn extract_bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn get_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_bearer_token)
}

fn requires_write(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Resolves the bearer token to a [`Principal`] and enforces roles.
///
/// Missing token → 401, unknown token → 403, a viewer attempting a mutation
/// → 403. `POST /api/evaluate` is a read for authorization purposes.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = get_token(request.headers()) else {
        return ApiError::Unauthorized.into_response();
    };
    let Some(role) = state.config.tokens.get(token).copied() else {
        return ApiError::Forbidden("invalid token").into_response();
    };

    let is_read_only_post = request.uri().path() == "/api/evaluate";
    if requires_write(request.method()) && !is_read_only_post && !role.can_write() {
        debug!(%role, path = request.uri().path(), "insufficient role");
        return ApiError::Forbidden("insufficient permissions").into_response();
    }

    let principal = Principal {
        token: token.to_string(),
        role,
    };
    request.extensions_mut().insert(principal);
    next.run(request).await
}
