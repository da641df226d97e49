use azproxy_http::HttpError;

/// Render an [`HttpError`] for logs and error messages.
///
/// Response bodies are left out on purpose: the identity provider echoes
/// request details that may include the client id.
#[must_use]
pub fn format_http_error(e: &HttpError, prefix: &str) -> String {
    match e {
        HttpError::HttpStatus { status, .. } => format!("{prefix} HTTP {status}"),
        HttpError::Json(err) => format!("{prefix} JSON parse failed: {err}"),
        HttpError::Timeout(d) => format!("{prefix} request timed out after {}ms", d.as_millis()),
        HttpError::IdleTimeout(d) => format!("{prefix} no data received for {}ms", d.as_millis()),
        HttpError::Connect(err) => format!("{prefix} connect error: {err}"),
        HttpError::Transport(err) => format!("{prefix} transport error: {err}"),
        HttpError::Tls(err) => format!("{prefix} TLS error: {err}"),
        HttpError::BodyTooLarge { limit, actual } => {
            format!("{prefix} response too large: limit {limit} bytes, got {actual} bytes")
        }
        HttpError::RequestBuild(err) => format!("{prefix} request build failed: {err}"),
        HttpError::InvalidHeaderName(err) => format!("{prefix} invalid header name: {err}"),
        HttpError::InvalidHeaderValue(_) => format!("{prefix} invalid header value"),
        HttpError::FormEncode(err) => format!("{prefix} form encode error: {err}"),
        HttpError::Overloaded => format!("{prefix} request rejected: service overloaded"),
        HttpError::ServiceClosed => format!("{prefix} service unavailable"),
        HttpError::InvalidUri { url, reason, .. } => {
            format!("{prefix} invalid URL '{url}': {reason}")
        }
        HttpError::InvalidScheme { scheme, reason } => {
            format!("{prefix} invalid scheme '{scheme}': {reason}")
        }
        _ => format!("{prefix} request failed"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_excludes_body() {
        let err = HttpError::HttpStatus {
            status: http::StatusCode::BAD_REQUEST,
            body_preview: "AADSTS7000215: Invalid client secret".into(),
            retry_after: None,
        };
        let msg = format_http_error(&err, "token endpoint");
        assert_eq!(msg, "token endpoint HTTP 400 Bad Request");
        assert!(!msg.contains("AADSTS"));
    }

    #[test]
    fn timeout_renders_duration() {
        let msg = format_http_error(&HttpError::Timeout(Duration::from_secs(30)), "IdP");
        assert_eq!(msg, "IdP request timed out after 30000ms");
    }

    #[test]
    fn prefix_on_every_variant() {
        for err in [
            HttpError::Overloaded,
            HttpError::ServiceClosed,
            HttpError::IdleTimeout(Duration::from_secs(1)),
        ] {
            assert!(format_http_error(&err, "CTX").starts_with("CTX "));
        }
    }
}
