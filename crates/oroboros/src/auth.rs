//! # Request Credentials
//!
//! Identity is issued elsewhere; this edge only reads opaque headers:
//!
//! | header            | grants                                 |
//! |-------------------|----------------------------------------|
//! | `x-admin-token`   | [`Caller::Admin`] (ledger `adjust`)    |
//! | `x-service-token` | [`Caller::Service`] (saga primitives)  |
//! | `x-user-id`       | [`Caller::Player`] (own items, factory)|
//!
//! A token header that is present but wrong is rejected outright rather
//! than falling back to a weaker credential.

use axum::http::HeaderMap;
use oroboros_economy::{Caller, UserId};
use serde::{Deserialize, Serialize};

use crate::error::HttpError;

/// Authenticated end-user id.
pub const USER_HEADER: &str = "x-user-id";
/// Backend service credential.
pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";
/// Operator credential.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Tokens accepted by this server. A missing token disables that class.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Token of backend services.
    pub service_token: Option<String>,
    /// Token of operators.
    pub admin_token: Option<String>,
}

impl Credentials {
    /// Resolves the strongest credential a request carries.
    ///
    /// # Errors
    ///
    /// Returns a 401 if a token is wrong or no credential is present.
    pub fn caller(&self, headers: &HeaderMap) -> Result<Caller, HttpError> {
        if let Some(presented) = header(headers, ADMIN_TOKEN_HEADER) {
            return if token_matches(self.admin_token.as_deref(), presented) {
                Ok(Caller::Admin)
            } else {
                Err(HttpError::unauthenticated("invalid admin token"))
            };
        }
        if let Some(presented) = header(headers, SERVICE_TOKEN_HEADER) {
            return if token_matches(self.service_token.as_deref(), presented) {
                Ok(Caller::Service)
            } else {
                Err(HttpError::unauthenticated("invalid service token"))
            };
        }
        self.player(headers).map(Caller::Player)
    }

    /// Reads the end-user id.
    ///
    /// # Errors
    ///
    /// Returns a 401 if the header is missing or not a number.
    pub fn player(&self, headers: &HeaderMap) -> Result<UserId, HttpError> {
        let Some(raw) = header(headers, USER_HEADER) else {
            return Err(HttpError::unauthenticated("x-user-id header required"));
        };
        raw.trim()
            .parse()
            .map_err(|_| HttpError::unauthenticated("x-user-id must be a numeric user id"))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Compares without stopping at the first differing byte.
fn token_matches(expected: Option<&str>, presented: &str) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn credentials() -> Credentials {
        Credentials {
            service_token: Some("svc-secret".to_string()),
            admin_token: Some("ops-secret".to_string()),
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_credential_classes() {
        let creds = credentials();
        assert_eq!(
            creds.caller(&headers(&[(USER_HEADER, "42")])).unwrap(),
            Caller::Player(42)
        );
        assert_eq!(
            creds.caller(&headers(&[(SERVICE_TOKEN_HEADER, "svc-secret")])).unwrap(),
            Caller::Service
        );
        assert_eq!(
            creds
                .caller(&headers(&[(ADMIN_TOKEN_HEADER, "ops-secret"), (USER_HEADER, "42")]))
                .unwrap(),
            Caller::Admin
        );
    }

    #[test]
    fn test_wrong_token_does_not_fall_back() {
        let err = credentials()
            .caller(&headers(&[(SERVICE_TOKEN_HEADER, "guess"), (USER_HEADER, "42")]))
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_unconfigured_token_never_matches() {
        let creds = Credentials::default();
        assert!(creds.caller(&headers(&[(ADMIN_TOKEN_HEADER, "")])).is_err());
    }

    #[test]
    fn test_player_header_required() {
        assert!(credentials().player(&HeaderMap::new()).is_err());
        assert!(credentials().player(&headers(&[(USER_HEADER, "abc")])).is_err());
    }
}
