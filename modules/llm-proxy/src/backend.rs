//! Calls to the model backend.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use azproxy_http::{HttpClient, HttpError, parse_retry_after};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use tracing::instrument;
use url::Url;

use crate::credential::{Credential, CredentialCache};
use crate::error::{BackendError, BackendErrorKind};
use crate::events::{EventSink, ProxyEvent};

/// Raw body chunks of a streamed backend response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

/// Per-request time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Until response headers arrive.
    pub request: Duration,
    /// Longest gap between two body chunks.
    pub idle_read: Duration,
}

/// A request ready to go to the backend. Immutable once built.
pub struct BackendRequest {
    method: Method,
    target_url: Url,
    headers: HeaderMap,
    body: Bytes,
    streaming: bool,
    timeouts: Timeouts,
    credential: Arc<Credential>,
}

impl BackendRequest {
    /// Adds `Authorization: Bearer` from `credential` to `headers`, marked
    /// sensitive.
    ///
    /// # Errors
    /// `InvalidResponse` if the token cannot be used as a header value.
    pub fn new(
        method: Method,
        target_url: Url,
        mut headers: HeaderMap,
        body: Bytes,
        streaming: bool,
        timeouts: Timeouts,
        credential: Arc<Credential>,
    ) -> Result<Self, BackendError> {
        let mut bearer =
            HeaderValue::try_from(format!("Bearer {}", credential.token().expose())).map_err(
                |_| {
                    BackendError::new(
                        BackendErrorKind::InvalidResponse,
                        "identity provider returned a token that is not a valid header value",
                    )
                },
            )?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(Self {
            method,
            target_url,
            headers,
            body,
            streaming,
            timeouts,
            credential,
        })
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn target_url(&self) -> &Url {
        &self.target_url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    #[must_use]
    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }
}

impl std::fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRequest")
            .field("method", &self.method)
            .field("target_url", &self.target_url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("streaming", &self.streaming)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

pub enum BackendResponse {
    /// Whole body in memory: non-streaming calls, and non-retryable error
    /// statuses the client should see as-is.
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Stream(ChunkStream),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered { status, body, .. } => f
                .debug_struct("Buffered")
                .field("status", status)
                .field("body_len", &body.len())
                .finish_non_exhaustive(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// # Errors
    /// `Timeout`, `Unavailable` and `Unauthorized` as classified from the
    /// exchange; `InvalidResponse` for unusable bodies.
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError>;
}

/// [`Backend`] over `azproxy_http`.
pub struct HttpBackend {
    client: HttpClient,
    cache: Arc<CredentialCache>,
    events: Arc<dyn EventSink>,
}

impl HttpBackend {
    #[must_use]
    pub fn new(
        client: HttpClient,
        cache: Arc<CredentialCache>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            cache,
            events,
        }
    }

    async fn exchange(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.target_url.as_str())
            .timeout(request.timeouts.request)
            .idle_read_timeout(Some(request.timeouts.idle_read));
        for (name, value) in &request.headers {
            builder = builder.header_value(name.clone(), value.clone());
        }
        let response = builder
            .body_bytes(request.body.clone())
            .send()
            .await
            .map_err(map_http_error)?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            self.cache.invalidate_stale(&request.credential);
            return Err(BackendError::new(
                BackendErrorKind::Unauthorized,
                format!("backend rejected the credential with {status}"),
            ));
        }
        if is_transient(status) {
            return Err(BackendError::new(
                BackendErrorKind::Unavailable,
                format!("backend returned {status}"),
            )
            .with_retry_after(parse_retry_after(response.headers())));
        }

        if request.streaming && status.is_success() {
            let chunks = response.into_chunk_stream().map(|r| r.map_err(map_http_error));
            return Ok(BackendResponse::Stream(Box::pin(chunks)));
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_http_error)?;
        Ok(BackendResponse::Buffered {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    #[instrument(skip(self, request), fields(
        method = %request.method,
        path = request.target_url.path(),
        streaming = request.streaming,
    ))]
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let start = Instant::now();
        let result = self.exchange(request).await;
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(BackendResponse::Buffered { status, .. }) => {
                tracing::info!(
                    status_code = status.as_u16(),
                    duration_ms,
                    "backend call completed"
                );
            }
            Ok(BackendResponse::Stream(_)) => {
                tracing::info!(duration_ms, "backend stream opened");
            }
            Err(e) => {
                self.events.emit(ProxyEvent::BackendFailed {
                    kind: e.kind,
                    message: e.message.clone(),
                });
            }
        }
        result
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub(crate) fn map_http_error(err: HttpError) -> BackendError {
    let kind = if err.is_timeout() {
        BackendErrorKind::Timeout
    } else if err.is_connection_failure() || matches!(err, HttpError::Tls(_)) {
        BackendErrorKind::Unavailable
    } else {
        BackendErrorKind::InvalidResponse
    };
    BackendError::new(kind, err.to_string())
}
