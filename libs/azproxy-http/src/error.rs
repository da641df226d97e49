use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed
    ParseError,
    /// URL has no host
    MissingAuthority,
    /// URL has no scheme
    MissingScheme,
}

/// HTTP client error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// No response headers within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// A streamed body produced no data for longer than the idle-read timeout
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),

    /// TCP or TLS connection could not be established
    #[error("Connect error: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Any other transport failure (reset, protocol error, broken body)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// Non-2xx status, produced only by [`HttpResponse::error_for_status`]
    /// and the checked body readers.
    ///
    /// [`HttpResponse::error_for_status`]: crate::HttpResponse::error_for_status
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        retry_after: Option<Duration>,
    },

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// Request buffer is full; the request was not sent
    #[error("Service overloaded: request buffer full")]
    Overloaded,

    /// The buffer worker is gone
    #[error("Service unavailable: internal failure")]
    ServiceClosed,

    /// `reason` is diagnostic only; match on `kind`.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        url: String,
        kind: InvalidUriKind,
        reason: String,
    },

    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },
}

impl HttpError {
    /// True for the response-header and idle-read time limits.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::IdleTimeout(_))
    }

    /// True when the request never reached a usable connection, or the
    /// connection broke underneath it. These are safe to try again.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Transport(_) | Self::Overloaded | Self::ServiceClosed
        )
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            HttpError::Connect(Box::new(err))
        } else {
            HttpError::Transport(Box::new(err))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("connection refused")
        }
    }

    impl Error for Refused {}

    #[test]
    fn connect_error_keeps_source() {
        let err = HttpError::Connect(Box::new(Refused));
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<Refused>().is_some());
        assert!(err.is_connection_failure());
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeouts_are_classified() {
        assert!(HttpError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(HttpError::IdleTimeout(Duration::from_secs(1)).is_timeout());
        assert!(!HttpError::Overloaded.is_timeout());
    }

    #[test]
    fn idle_timeout_renders_duration() {
        let err = HttpError::IdleTimeout(Duration::from_secs(30));
        assert_eq!(err.to_string(), "No data received for 30s");
    }
}
