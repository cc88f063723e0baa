//! src/api/dto.rs
//!
//! JSON shapes and small helpers for the REST front-end that don't belong
//! on `ResourceModel` itself — collection envelopes, the error body every
//! failed request gets back, and the path-segment extractor that enforces
//! the same character class the original URL-template router compiled
//! into its regex.

use crate::error::Error;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request::Parts,
};
use serde::Serialize;
use std::collections::BTreeMap;

fn validate_segment(value: &str) -> Result<(), Error> {
    let valid = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "path segment {value:?} must match [0-9A-Za-z._-]+"
        )))
    }
}

/// A single validated `{name}` path template segment. `axum`'s router
/// doesn't restrict path segment charset on its own, unlike the original
/// regex-compiled URL router, so every route touching a user-supplied
/// name extracts through this instead of a bare `Path<String>`.
pub struct Segment(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Segment {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::Validation(e.to_string()))?;
        validate_segment(&value)?;
        Ok(Segment(value))
    }
}

/// Two validated `{name}` path template segments, for routes like
/// `/app/:appname/web-hooks/:hookname`.
pub struct Segment2(pub String, pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Segment2 {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path((a, b)) = Path::<(String, String)>::from_request_parts(parts, state)
            .await
            .map_err(|e| Error::Validation(e.to_string()))?;
        validate_segment(&a)?;
        validate_segment(&b)?;
        Ok(Segment2(a, b))
    }
}

#[derive(Serialize)]
pub struct AppsResponse {
    pub apps: Vec<String>,
}

#[derive(Serialize)]
pub struct ServicesResponse {
    pub services: BTreeMap<String, ServiceSummary>,
}

#[derive(Serialize)]
pub struct ServiceSummary {
    pub hosts: Vec<String>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}
