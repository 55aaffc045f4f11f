//! Origin check performed before a WebSocket upgrade is accepted.

use axum::http::{header::ORIGIN, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why an upgrade request was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing Origin header")]
    MissingOrigin,
    #[error("invalid Origin header: {0}")]
    InvalidOrigin(String),
    #[error("untrusted origin host: {0}")]
    UntrustedOrigin(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (StatusCode::FORBIDDEN, self.to_string()).into_response()
    }
}

/// Admits upgrade requests whose `Origin` hostname equals the trusted hostname.
///
/// Scheme and port are ignored. The hostname comparison is exact and
/// case-sensitive.
#[derive(Debug, Clone)]
pub struct OriginGate {
    trusted_host: String,
}

impl OriginGate {
    pub fn new(trusted_host: impl Into<String>) -> Self {
        Self {
            trusted_host: trusted_host.into(),
        }
    }

    /// Checks the request headers of an upgrade request.
    pub fn admit(&self, headers: &HeaderMap) -> Result<(), HandshakeError> {
        let origin = headers
            .get(ORIGIN)
            .ok_or(HandshakeError::MissingOrigin)?
            .to_str()
            .map_err(|_| HandshakeError::InvalidOrigin("non-ASCII value".to_string()))?;
        self.admit_origin(origin)
    }

    /// Checks a raw `Origin` header value.
    pub fn admit_origin(&self, origin: &str) -> Result<(), HandshakeError> {
        let host = origin_hostname(origin)
            .ok_or_else(|| HandshakeError::InvalidOrigin(origin.to_string()))?;
        if host == self.trusted_host {
            Ok(())
        } else {
            Err(HandshakeError::UntrustedOrigin(host))
        }
    }
}

/// Extracts the hostname of an absolute origin URL, without port or IPv6 brackets.
fn origin_hostname(origin: &str) -> Option<String> {
    let uri: Uri = origin.parse().ok()?;
    uri.scheme()?;
    let host = uri.host().filter(|host| !host.is_empty())?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn gate() -> OriginGate {
        OriginGate::new("trusted")
    }

    #[test]
    fn admits_trusted_host_with_any_scheme_or_port() {
        for origin in [
            "http://trusted",
            "http://trusted:8080",
            "https://trusted",
            "https://trusted:443/",
        ] {
            assert_eq!(gate().admit_origin(origin), Ok(()), "origin {}", origin);
        }
    }

    #[test]
    fn rejects_other_hosts() {
        for origin in [
            "http://evil.example",
            "http://trusted.evil.example",
            "http://evil.example:8080",
            "http://TRUSTED",
            "http://Trusted:8080",
        ] {
            assert!(
                matches!(
                    gate().admit_origin(origin),
                    Err(HandshakeError::UntrustedOrigin(_))
                ),
                "origin {}",
                origin
            );
        }
    }

    #[test]
    fn rejects_malformed_origins() {
        for origin in ["", "null", "trusted", "not a url", "http://"] {
            assert!(
                matches!(
                    gate().admit_origin(origin),
                    Err(HandshakeError::InvalidOrigin(_))
                ),
                "origin {:?}",
                origin
            );
        }
    }

    #[test]
    fn strips_ipv6_brackets() {
        let gate = OriginGate::new("::1");
        assert_eq!(gate.admit_origin("http://[::1]:8080"), Ok(()));
    }

    #[test]
    fn reads_the_origin_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(gate().admit(&headers), Err(HandshakeError::MissingOrigin));

        headers.insert(ORIGIN, HeaderValue::from_static("http://trusted:8080"));
        assert_eq!(gate().admit(&headers), Ok(()));

        headers.insert(ORIGIN, HeaderValue::from_static("http://evil.example"));
        assert_eq!(
            gate().admit(&headers),
            Err(HandshakeError::UntrustedOrigin("evil.example".to_string()))
        );
    }

    #[test]
    fn rejection_is_forbidden() {
        let response = HandshakeError::MissingOrigin.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
