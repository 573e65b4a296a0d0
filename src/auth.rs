use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde_json::json;

use crate::artifact_store::validate_component;

/// Set by the upstream session layer to the authenticated user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

pub fn verify_bearer(
    headers: &HeaderMap,
    expected_key: &str,
) -> Result<(), (StatusCode, Json<serde_json::Value>)> {
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(unauthorized("Invalid API key"));
    }

    Ok(())
}

pub fn extract_bearer_token(
    headers: &HeaderMap,
) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(unauthorized("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(unauthorized("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(unauthorized("Authorization must use Bearer token"));
    };

    Ok(token.to_string())
}

/// Checks the API key and returns the calling user's id.
pub fn authenticate(
    headers: &HeaderMap,
    expected_key: &str,
) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    verify_bearer(headers, expected_key)?;

    let Some(raw) = headers.get(USER_ID_HEADER) else {
        return Err(unauthorized("Missing X-User-Id header"));
    };
    let Ok(user) = raw.to_str() else {
        return Err(unauthorized("Invalid X-User-Id header"));
    };
    let user = user.trim();
    if validate_component(user).is_err() {
        return Err(unauthorized("Invalid X-User-Id header"));
    }

    Ok(user.to_string())
}

fn unauthorized(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "code": "UNAUTHORIZED",
                "message": message
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue, StatusCode};

    use super::*;

    fn headers(auth: Option<&str>, user: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(auth).expect("header"));
        }
        if let Some(user) = user {
            headers.insert(USER_ID_HEADER, HeaderValue::from_str(user).expect("header"));
        }
        headers
    }

    #[test]
    fn bearer_and_user_are_both_required() {
        assert_eq!(
            authenticate(&headers(Some("Bearer k"), Some("user-1")), "k").expect("auth"),
            "user-1"
        );

        let (status, _) = authenticate(&headers(Some("Bearer wrong"), Some("user-1")), "k")
            .expect_err("bad key");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(authenticate(&headers(Some("Bearer k"), None), "k").is_err());
        assert!(authenticate(&headers(Some("Basic k"), Some("user-1")), "k").is_err());
    }

    #[test]
    fn user_ids_that_could_escape_storage_are_rejected() {
        for bad in ["../other", "a/b", ".."] {
            assert!(authenticate(&headers(Some("Bearer k"), Some(bad)), "k").is_err());
        }
    }
}
