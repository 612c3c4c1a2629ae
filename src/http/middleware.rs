//! Admin authentication middleware

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use tracing::warn;

use crate::app::AppState;

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Admin access is disabled")]
    Disabled,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingHeader => StatusCode::UNAUTHORIZED,
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::Disabled => StatusCode::FORBIDDEN,
        };

        (status, self.to_string()).into_response()
    }
}

/// Compare without short-circuiting on the first differing byte
fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && provided
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Middleware to require the configured admin bearer token
pub async fn require_admin(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let expected = state.config.admin_token.as_str();
    if expected.is_empty() {
        return Err(AuthError::Disabled);
    }

    let TypedHeader(Authorization(bearer)) = bearer.ok_or(AuthError::MissingHeader)?;
    if !tokens_match(bearer.token(), expected) {
        warn!(path = %request.uri().path(), "Rejected admin request");
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        assert!(tokens_match("secret", "secret"));
        assert!(!tokens_match("secreT", "secret"));
        assert!(!tokens_match("secret-but-longer", "secret"));
    }
}
