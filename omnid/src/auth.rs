//! Auth Gate: single shared-secret check for HTTP and streaming connections.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use omni_common::AgentError;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::context::AgentContext;
use crate::http_api::ApiError;

pub const TOKEN_HEADER: &str = "x-omni-token";

#[derive(Clone)]
pub struct AuthGate {
    token: Arc<str>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").field("token", &"***").finish()
    }
}

impl AuthGate {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::from(token.into()),
        }
    }

    /// Constant-time comparison against the configured secret. An empty
    /// secret accepts nothing.
    pub fn verify(&self, presented: Option<&str>) -> Result<(), AgentError> {
        let Some(presented) = presented else {
            return Err(AgentError::Unauthorized);
        };
        if self.token.is_empty() {
            return Err(AgentError::Unauthorized);
        }
        if bool::from(self.token.as_bytes().ct_eq(presented.as_bytes())) {
            Ok(())
        } else {
            Err(AgentError::Unauthorized)
        }
    }
}

/// A non-blank `X-Omni-Token`, else `Authorization: Bearer <token>`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let custom = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if custom.is_some() {
        return custom;
    }
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(token.trim())
}

/// Middleware for every HTTP route.
pub async fn require_token(
    State(ctx): State<Arc<AgentContext>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Err(err) = ctx.auth.verify(token_from_headers(request.headers())) {
        debug!(path = %request.uri().path(), "rejected unauthenticated request");
        return Err(err.into());
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use proptest::prelude::*;

    #[test]
    fn exact_token_is_accepted() {
        let gate = AuthGate::new("s3cret-Token");
        assert!(gate.verify(Some("s3cret-Token")).is_ok());
    }

    #[test]
    fn near_misses_are_rejected() {
        let gate = AuthGate::new("s3cret-Token");
        for candidate in ["s3cret-token", "S3CRET-TOKEN", "s3cret-Tokem", "s3cret-Token ", "", "s3cret"] {
            assert!(gate.verify(Some(candidate)).is_err(), "accepted {candidate:?}");
        }
        assert!(gate.verify(None).is_err());
    }

    #[test]
    fn empty_configured_token_rejects_everything() {
        let gate = AuthGate::new("");
        assert!(gate.verify(Some("")).is_err());
        assert!(gate.verify(Some("anything")).is_err());
    }

    #[test]
    fn token_read_from_custom_header_or_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_headers(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(token_from_headers(&headers), Some("abc"));

        headers.insert(TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(token_from_headers(&headers), Some("xyz"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(token_from_headers(&basic), None);
    }

    #[test]
    fn blank_custom_header_falls_back_to_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("   "));
        assert_eq!(token_from_headers(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(token_from_headers(&headers), Some("abc"));

        headers.insert(TOKEN_HEADER, HeaderValue::from_static(""));
        assert_eq!(token_from_headers(&headers), Some("abc"));
    }

    #[test]
    fn debug_output_hides_secret() {
        let gate = AuthGate::new("hunter2");
        assert!(!format!("{gate:?}").contains("hunter2"));
    }

    proptest! {
        #[test]
        fn only_the_exact_token_is_accepted(candidate in "[ -~]{0,24}") {
            let gate = AuthGate::new("s3cret-Token");
            prop_assert_eq!(gate.verify(Some(&candidate)).is_ok(), candidate == "s3cret-Token");
        }
    }
}
