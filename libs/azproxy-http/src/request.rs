use crate::client::{BufferedService, map_buffer_error, try_acquire_buffer_slot};
use crate::config::TransportSecurity;
use crate::error::{HttpError, InvalidUriKind};
use crate::response::{HttpResponse, ResponseBody};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Request, Response};
use http_body_util::Full;
use serde::Serialize;
use std::time::Duration;
use tower::Service;

#[derive(Clone, Debug)]
enum BodyKind {
    Empty,
    Bytes(Bytes),
    Json(Bytes),
    Form(Bytes),
}

/// Request under construction.
///
/// Created by [`HttpClient::get`](crate::HttpClient::get),
/// [`HttpClient::post`](crate::HttpClient::post) or
/// [`HttpClient::request`](crate::HttpClient::request). Header errors are
/// deferred and reported by [`send`](Self::send) (or by the next fallible
/// body setter), so calls can be chained freely.
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    service: BufferedService,
    max_body_size: usize,
    idle_read_timeout: Option<Duration>,
    timeout: Option<Duration>,
    method: http::Method,
    url: String,
    headers: Vec<(HeaderName, HeaderValue)>,
    body: BodyKind,
    error: Option<HttpError>,
    transport_security: TransportSecurity,
}

impl RequestBuilder {
    pub(crate) fn new(
        service: BufferedService,
        max_body_size: usize,
        idle_read_timeout: Option<Duration>,
        method: http::Method,
        url: String,
        transport_security: TransportSecurity,
    ) -> Self {
        Self {
            service,
            max_body_size,
            idle_read_timeout,
            timeout: None,
            method,
            url,
            headers: Vec::new(),
            body: BodyKind::Empty,
            error: None,
            transport_security,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Add an already-validated header, e.g. one copied from an inbound request.
    pub fn header_value(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }

    /// Add a header whose value must never show up in logs or `Debug` output.
    pub fn sensitive_header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(mut value)) => {
                value.set_sensitive(true);
                self.headers.push((name, value));
            }
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// JSON body; `Content-Type: application/json` unless one was set.
    ///
    /// # Errors
    /// A deferred header error, or `HttpError::Json` if serialization fails.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Json(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Form body; `Content-Type: application/x-www-form-urlencoded` unless one was set.
    ///
    /// # Errors
    /// A deferred header error, or `HttpError::FormEncode`.
    pub fn form(mut self, fields: &[(&str, &str)]) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.body = BodyKind::Form(Bytes::from(serde_urlencoded::to_string(fields)?));
        Ok(self)
    }

    /// Tighter time limit for response headers on this request only. The
    /// client-wide timeout still applies.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Idle-read limit for this response's body stream; `None` disables it.
    pub fn idle_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_read_timeout = timeout;
        self
    }

    /// Raw body, sent as-is. Set `Content-Type` yourself if the peer needs one.
    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = BodyKind::Bytes(body);
        self
    }

    fn validate_url(&self) -> Result<http::Uri, HttpError> {
        let uri: http::Uri =
            self.url
                .parse()
                .map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
                    url: self.url.clone(),
                    kind: InvalidUriKind::ParseError,
                    reason: e.to_string(),
                })?;

        if uri.authority().is_none() {
            return Err(HttpError::InvalidUri {
                url: self.url.clone(),
                kind: InvalidUriKind::MissingAuthority,
                reason: "missing host/authority".to_owned(),
            });
        }

        match uri.scheme_str() {
            Some("https") => Ok(uri),
            Some("http") => match self.transport_security {
                TransportSecurity::AllowInsecureHttp => Ok(uri),
                TransportSecurity::TlsOnly => Err(HttpError::InvalidScheme {
                    scheme: "http".to_owned(),
                    reason: "HTTPS required (transport security is TlsOnly)".to_owned(),
                }),
            },
            Some(scheme) => Err(HttpError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            }),
            None => Err(HttpError::InvalidUri {
                url: self.url.clone(),
                kind: InvalidUriKind::MissingScheme,
                reason: "missing scheme".to_owned(),
            }),
        }
    }

    /// Send the request.
    ///
    /// Resolves once response headers arrive, for any status. The body is
    /// read afterwards through the returned [`HttpResponse`].
    ///
    /// # Errors
    /// Deferred build errors, URL/scheme validation, `Overloaded` when the
    /// request buffer is full, then connect, TLS, transport or timeout errors.
    pub async fn send(mut self) -> Result<HttpResponse, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }

        let uri = self.validate_url()?;
        let mut builder = Request::builder().method(self.method).uri(uri);

        let has_content_type = self.headers.iter().any(|(name, _)| name == CONTENT_TYPE);
        if !has_content_type {
            match &self.body {
                BodyKind::Json(_) => {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
                BodyKind::Form(_) => {
                    builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
                }
                BodyKind::Empty | BodyKind::Bytes(_) => {}
            }
        }
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }

        let body = match self.body {
            BodyKind::Empty => Bytes::new(),
            BodyKind::Bytes(b) | BodyKind::Json(b) | BodyKind::Form(b) => b,
        };
        let request = builder.body(Full::new(body))?;

        try_acquire_buffer_slot(&mut self.service).await?;

        let call = self.service.call(request);
        let inner: Response<ResponseBody> = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| HttpError::Timeout(limit))?,
            None => call.await,
        }
        .map_err(map_buffer_error)?;

        Ok(HttpResponse {
            inner,
            max_body_size: self.max_body_size,
            idle_read_timeout: self.idle_read_timeout,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use crate::{HttpClient, HttpClientConfig, HttpError, InvalidUriKind};

    fn tls_only_client() -> HttpClient {
        HttpClient::builder().build().unwrap()
    }

    #[tokio::test]
    async fn plain_http_rejected_when_tls_only() {
        let err = tls_only_client()
            .get("http://localhost:1/")
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidScheme { ref scheme, .. } if scheme == "http"));
    }

    #[tokio::test]
    async fn relative_url_rejected() {
        let err = tls_only_client().get("/just/a/path").send().await.unwrap_err();
        assert!(matches!(
            err,
            HttpError::InvalidUri {
                kind: InvalidUriKind::MissingAuthority,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn bad_header_is_deferred_to_send() {
        let client = HttpClient::builder()
            .config(HttpClientConfig::for_testing())
            .build()
            .unwrap();
        let err = client
            .get("http://localhost:1/")
            .header("bad header", "x")
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeaderName(_)));
    }

    #[tokio::test]
    async fn json_surfaces_deferred_error() {
        let res = tls_only_client()
            .post("https://example.com/")
            .header("x-ok", "bad\nvalue")
            .json(&serde_json::json!({"a": 1}));
        assert!(matches!(res, Err(HttpError::InvalidHeaderValue(_))));
    }
}
