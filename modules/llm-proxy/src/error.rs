//! Error types of the proxy and their mapping to HTTP responses.

use std::time::Duration;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::{HeaderValue, StatusCode, header::RETRY_AFTER};
use serde::Serialize;
use thiserror::Error;

/// Configuration problems found by `ProxyConfig::validate`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting '{field}'")]
    Missing { field: &'static str },

    #[error("invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn missing(field: &'static str) -> Self {
        Self::Missing { field }
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures while wiring up a [`Proxy`](crate::Proxy).
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("identity provider client: {0}")]
    Token(#[from] azproxy_auth::TokenError),

    #[error("backend HTTP client: {0}")]
    Http(#[from] azproxy_http::HttpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    InvalidKey,
    IpDenied,
    RateLimited,
    InvalidBody,
}

impl DenyReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid_key",
            Self::IpDenied => "ip_denied",
            Self::RateLimited => "rate_limited",
            Self::InvalidBody => "invalid_body",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request rejected: {reason}")]
pub struct AdmissionDenied {
    pub reason: DenyReason,
    /// Set for `RateLimited`: when the bucket has room again.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("token refresh for scope '{scope}' failed: {message}")]
    RefreshFailed { scope: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendErrorKind {
    Timeout,
    Unavailable,
    InvalidResponse,
    Unauthorized,
}

impl BackendErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::InvalidResponse => "invalid_response",
            Self::Unauthorized => "unauthorized",
        }
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("backend {}: {message}", kind.as_str())]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
    /// Upstream `Retry-After`, if it sent one.
    pub retry_after: Option<Duration>,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Client-facing text for a failed token refresh. Provider detail stays in
/// the logs.
pub(crate) const CREDENTIALS_UNAVAILABLE: &str = "failed to obtain backend credentials";

/// Why a stream ended without a completion marker.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayFailed {
    #[error("gave up after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: BackendError },

    #[error("stream failed: {0}")]
    NonRetryable(BackendError),
}

impl RelayFailed {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AttemptsExhausted { .. } => "relay_attempts_exhausted",
            Self::NonRetryable(_) => "relay_non_retryable",
        }
    }

    /// The in-band body sent as the last event of a failed stream.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.to_string(), "upstream_error", self.code())
    }
}

/// Anything that ends a proxied request with an error status.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Admission(#[from] AdmissionDenied),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ProxyError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        self.parts().1
    }

    fn parts(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            Self::Admission(denied) => match denied.reason {
                DenyReason::InvalidKey => {
                    (StatusCode::FORBIDDEN, "invalid_key", "permission_error")
                }
                DenyReason::IpDenied => (StatusCode::FORBIDDEN, "ip_denied", "permission_error"),
                DenyReason::RateLimited => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "rate_limit_error",
                ),
                DenyReason::InvalidBody => (
                    StatusCode::BAD_REQUEST,
                    "invalid_body",
                    "invalid_request_error",
                ),
            },
            Self::Auth(AuthError::RefreshFailed { .. }) => (
                StatusCode::BAD_GATEWAY,
                "auth_refresh_failed",
                "upstream_error",
            ),
            Self::Backend(err) => match err.kind {
                BackendErrorKind::Timeout => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "backend_timeout",
                    "upstream_error",
                ),
                BackendErrorKind::Unavailable => (
                    StatusCode::BAD_GATEWAY,
                    "backend_unavailable",
                    "upstream_error",
                ),
                BackendErrorKind::InvalidResponse => (
                    StatusCode::BAD_GATEWAY,
                    "backend_invalid_response",
                    "upstream_error",
                ),
                BackendErrorKind::Unauthorized => (
                    StatusCode::BAD_GATEWAY,
                    "backend_unauthorized",
                    "upstream_error",
                ),
            },
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Admission(denied) => denied.retry_after,
            Self::Backend(err) => err.retry_after,
            Self::Auth(_) => None,
        }
    }

    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        let (_, code, kind) = self.parts();
        let message = match self {
            Self::Auth(_) => CREDENTIALS_UNAVAILABLE.to_owned(),
            other => other.to_string(),
        };
        ErrorBody::new(message, kind, code)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(
                status = status.as_u16(),
                code = self.code(),
                error = %self,
                "request failed"
            );
        }
        let retry_after = self.retry_after();
        let mut response = (status, Json(self.to_body())).into_response();
        if let Some(delay) = retry_after {
            let secs = delay.as_secs() + u64::from(delay.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// OpenAI-style error envelope: `{"error":{"message","type","code"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: &'static str,
}

impl ErrorBody {
    fn new(message: String, kind: &'static str, code: &'static str) -> Self {
        Self {
            error: ErrorDetail {
                message,
                kind,
                code,
            },
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn denied(reason: DenyReason) -> ProxyError {
        AdmissionDenied {
            reason,
            retry_after: None,
        }
        .into()
    }

    fn backend(kind: BackendErrorKind) -> ProxyError {
        BackendError::new(kind, "boom").into()
    }

    #[test]
    fn status_table() {
        let cases = [
            (denied(DenyReason::InvalidKey), 403, "invalid_key"),
            (denied(DenyReason::IpDenied), 403, "ip_denied"),
            (denied(DenyReason::RateLimited), 429, "rate_limited"),
            (denied(DenyReason::InvalidBody), 400, "invalid_body"),
            (
                AuthError::RefreshFailed {
                    scope: "s".into(),
                    message: "m".into(),
                }
                .into(),
                502,
                "auth_refresh_failed",
            ),
            (backend(BackendErrorKind::Timeout), 504, "backend_timeout"),
            (backend(BackendErrorKind::Unavailable), 502, "backend_unavailable"),
            (
                backend(BackendErrorKind::InvalidResponse),
                502,
                "backend_invalid_response",
            ),
            (
                backend(BackendErrorKind::Unauthorized),
                502,
                "backend_unauthorized",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status, "{err}");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn only_timeout_and_unavailable_retry() {
        assert!(BackendErrorKind::Timeout.is_retryable());
        assert!(BackendErrorKind::Unavailable.is_retryable());
        assert!(!BackendErrorKind::InvalidResponse.is_retryable());
        assert!(!BackendErrorKind::Unauthorized.is_retryable());
    }

    #[test]
    fn relay_codes() {
        let last = BackendError::new(BackendErrorKind::Timeout, "idle");
        let exhausted = RelayFailed::AttemptsExhausted { attempts: 3, last };
        assert_eq!(exhausted.code(), "relay_attempts_exhausted");
        let body = serde_json::to_value(exhausted.to_body()).unwrap();
        assert_eq!(body["error"]["code"], "relay_attempts_exhausted");
        assert_eq!(body["error"]["type"], "upstream_error");
    }

    #[tokio::test]
    async fn response_has_envelope_and_retry_after() {
        let err: ProxyError = AdmissionDenied {
            reason: DenyReason::RateLimited,
            retry_after: Some(Duration::from_millis(1500)),
        }
        .into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["code"], "rate_limited");
        assert_eq!(value["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn auth_message_is_generic() {
        let err: ProxyError = AuthError::RefreshFailed {
            scope: "s".into(),
            message: "AADSTS7000215: invalid client secret".into(),
        }
        .into();
        let body = err.to_body();
        assert!(!body.error.message.contains("AADSTS"));
    }
}
