use std::collections::HashSet;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{middleware::Next, Json};
use serde_json::json;
use tracing::debug;

/// Decides whether a bearer credential grants access.
///
/// The credential is opaque to the server; an implementation may check it
/// against a static set, an external identity service, or anything else.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> bool;
}

/// Static bearer-token allow list.
///
/// An empty token set disables authentication entirely (development and
/// in-process tests).
#[derive(Debug, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashSet<String>,
}

impl StaticTokenAuthorizer {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, token: Option<&str>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        token.is_some_and(|t| self.tokens.contains(t))
    }
}

/// Bearer token authentication middleware
///
/// Rejects the request with 401 unless the Authorization header carries a
/// credential the authorizer accepts.
pub async fn bearer_auth_middleware(
    authorizer: Arc<dyn Authorizer>,
    request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    if authorizer.authorize(extract_token(&request)) {
        next.run(request).await
    } else {
        debug!("rejected request without valid bearer token");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid bearer token" })),
        )
            .into_response()
    }
}

/// Extract the bearer token from the Authorization header
fn extract_token(request: &axum::http::Request<axum::body::Body>) -> Option<&str> {
    let auth_str = request.headers().get("authorization")?.to_str().ok()?;
    // Handle both "Bearer <token>" and raw token
    Some(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(header: Option<&str>) -> axum::http::Request<axum::body::Body> {
        let mut builder = axum::http::Request::builder();
        if let Some(value) = header {
            builder = builder.header("authorization", value);
        }
        builder.body(axum::body::Body::empty()).unwrap()
    }

    #[test]
    fn empty_token_set_allows_everything() {
        let authorizer = StaticTokenAuthorizer::new(vec![]);
        assert!(authorizer.authorize(None));
        assert!(authorizer.authorize(Some("anything")));
    }

    #[test]
    fn known_token_with_bearer_prefix() {
        let authorizer = StaticTokenAuthorizer::new(vec!["secret".to_string()]);
        assert!(authorizer.authorize(extract_token(&request(Some("Bearer secret")))));
    }

    #[test]
    fn known_token_without_prefix() {
        let authorizer = StaticTokenAuthorizer::new(vec!["secret".to_string()]);
        assert!(authorizer.authorize(extract_token(&request(Some("secret")))));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let authorizer = StaticTokenAuthorizer::new(vec!["secret".to_string()]);
        assert!(!authorizer.authorize(extract_token(&request(Some("Bearer wrong")))));
        assert!(!authorizer.authorize(extract_token(&request(None))));
    }
}
