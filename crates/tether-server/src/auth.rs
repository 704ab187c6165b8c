//! Token authentication for the HTTP and upgrade endpoints.
//!
//! Telemetry and the JSON endpoints take `Authorization: Bearer <token>`.
//! Browsers cannot set headers on a websocket upgrade, so the terminal endpoint
//! takes `?token=<token>` instead.

use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Decides whether an access token is acceptable
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts a fixed set of tokens
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        !token.is_empty() && self.tokens.contains(token)
    }
}

/// JSON body of a rejected request
#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: &'static str,
}

/// Rejection for missing or invalid credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingCredentials,
    InvalidCredentials,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let error = match self {
            AuthRejection::MissingCredentials => "Authentication required",
            AuthRejection::InvalidCredentials => "Invalid token",
        };
        (StatusCode::UNAUTHORIZED, Json(AuthErrorResponse { error })).into_response()
    }
}

/// Request carried a valid bearer token
#[derive(Debug)]
pub struct RequireBearer;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireBearer
where
    Arc<dyn TokenValidator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthRejection::MissingCredentials)?;
        check(&Arc::<dyn TokenValidator>::from_ref(state), &token)?;
        Ok(RequireBearer)
    }
}

/// Request carried a valid `token` query parameter
#[derive(Debug)]
pub struct RequireQueryToken;

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for RequireQueryToken
where
    Arc<dyn TokenValidator>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = query_token(parts).ok_or(AuthRejection::MissingCredentials)?;
        check(&Arc::<dyn TokenValidator>::from_ref(state), &token)?;
        Ok(RequireQueryToken)
    }
}

fn check(validator: &Arc<dyn TokenValidator>, token: &str) -> Result<(), AuthRejection> {
    if validator.validate(token) {
        Ok(())
    } else {
        debug!("Rejected access token");
        Err(AuthRejection::InvalidCredentials)
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn query_token(parts: &Parts) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(&parts.uri).ok()?;
    query.token.filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(uri: &str, authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::new(["alpha", "beta"]);
        assert!(validator.validate("alpha"));
        assert!(validator.validate("beta"));
        assert!(!validator.validate("gamma"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_bearer_extraction() {
        assert_eq!(bearer_token(&parts("/", Some("Bearer abc"))), Some("abc".to_string()));
        assert_eq!(bearer_token(&parts("/", Some("Basic abc"))), None);
        assert_eq!(bearer_token(&parts("/", Some("Bearer  "))), None);
        assert_eq!(bearer_token(&parts("/", None)), None);
    }

    #[test]
    fn test_query_extraction() {
        assert_eq!(query_token(&parts("/ws?token=abc", None)), Some("abc".to_string()));
        assert_eq!(query_token(&parts("/ws?x=1&token=a%2Bb", None)), Some("a+b".to_string()));
        assert_eq!(query_token(&parts("/ws?token=", None)), None);
        assert_eq!(query_token(&parts("/ws", None)), None);
    }
}
