//! Caller identity.
//!
//! There is no real authentication yet: the caller names itself through a
//! header, a cookie or a query parameter.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::header::COOKIE;
use std::convert::Infallible;

pub const USER_HEADER: &str = "x-user-id";
const USER_PARAM: &str = "user_id";
const FALLBACK_USER: &str = "test-user";

/// Identity of the caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

impl CallerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn from_header(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn from_cookie(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == USER_PARAM && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn from_query(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, value)| name == USER_PARAM && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = from_header(parts)
            .or_else(|| from_cookie(parts))
            .or_else(|| from_query(parts))
            .unwrap_or_else(|| FALLBACK_USER.to_string());
        Ok(CallerId(user))
    }
}
