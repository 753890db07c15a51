//! Proxy credentials
//!
//! Extracts Basic credentials from `Proxy-Authorization` so routing can
//! match on them. Nothing is verified here; a header that cannot be decoded
//! is answered with a 407 challenge.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Response, StatusCode};
use tracing::debug;

use crate::error::{Result, RouterError};

pub const DEFAULT_REALM: &str = "Proxy";

/// Username and password presented by a proxy client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    /// Read credentials from the request headers.
    ///
    /// Returns `Ok(None)` when the header is absent and an error when it is
    /// present but not a well-formed Basic value.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>> {
        let Some(value) = headers.get(PROXY_AUTHORIZATION) else {
            return Ok(None);
        };

        let value = value.to_str().map_err(|_| RouterError::Unauthorized)?;

        let (scheme, encoded) = value.trim().split_once(' ').ok_or(RouterError::Unauthorized)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            debug!("Unsupported Proxy-Authorization scheme: {}", scheme);
            return Err(RouterError::Unauthorized);
        }

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| RouterError::Unauthorized)?;
        let credentials = String::from_utf8(decoded).map_err(|_| RouterError::Unauthorized)?;

        let (username, password) = credentials
            .split_once(':')
            .ok_or(RouterError::Unauthorized)?;

        Ok(Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }
}

/// 407 Proxy Authentication Required with a Basic challenge
pub fn challenge_response(realm: Option<&str>) -> Response<Full<Bytes>> {
    let realm = realm.filter(|r| !r.is_empty()).unwrap_or(DEFAULT_REALM);
    let challenge = format!("Basic realm=\"{}\"", realm.replace('"', "'"));

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    if let Ok(value) = challenge.parse() {
        response.headers_mut().insert(PROXY_AUTHENTICATE, value);
    }
    response
}
