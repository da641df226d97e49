//! Request flow: admission, credential, dispatch, buffered or streamed reply.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azproxy_auth::{OAuthTokenSource, TokenSource};
use azproxy_http::HttpClientBuilder;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::admission::{AdmissionFilter, AdmissionRequest};
use crate::backend::{Backend, BackendRequest, BackendResponse, ChunkStream, HttpBackend, Timeouts};
use crate::config::ProxyConfig;
use crate::credential::CredentialCache;
use crate::error::{
    AdmissionDenied, AuthError, BackendError, BackendErrorKind, CREDENTIALS_UNAVAILABLE,
    ConfigError, InitError, ProxyError,
};
use crate::events::{EventSink, ProxyEvent};
use crate::relay::{AttemptSource, RelayHandle, RelayPolicy, RelaySession};

/// Request headers copied to the backend.
const FORWARDED_HEADERS: [&str; 4] = [
    "content-type",
    "accept",
    "x-ms-client-request-id",
    "x-request-id",
];

/// Response headers that describe the hop, not the payload.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChatCompletions,
    Completions,
    Embeddings,
}

impl Operation {
    pub const ALL: [Self; 3] = [Self::ChatCompletions, Self::Completions, Self::Embeddings];

    /// Path below the deployment, e.g. `chat/completions`.
    #[must_use]
    pub fn as_path(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat/completions",
            Self::Completions => "completions",
            Self::Embeddings => "embeddings",
        }
    }

    /// Inbound path, with or without the `/v1` prefix.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.strip_prefix("/v1").unwrap_or(path);
        let path = path.trim_matches('/');
        Self::ALL.into_iter().find(|op| op.as_path() == path)
    }

    fn index(self) -> usize {
        match self {
            Self::ChatCompletions => 0,
            Self::Completions => 1,
            Self::Embeddings => 2,
        }
    }
}

/// A client request as the router hands it over.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub operation: Operation,
    pub method: Method,
    pub headers: HeaderMap,
    pub peer: Option<IpAddr>,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum ProxyResponse {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Server-sent events, one complete event per item.
    Stream(RelayHandle),
}

/// The per-operation backend URLs, resolved once.
#[derive(Debug)]
struct Targets {
    urls: [Url; 3],
}

impl Targets {
    fn new(endpoint: &str, deployment: &str, api_version: &str) -> Result<Self, ConfigError> {
        let base = Url::parse(endpoint)
            .map_err(|e| ConfigError::invalid("backend.endpoint", e.to_string()))?;
        let build = |op: Operation| -> Result<Url, ConfigError> {
            let mut url = base.clone();
            url.path_segments_mut()
                .map_err(|()| ConfigError::invalid("backend.endpoint", "cannot be a base URL"))?
                .pop_if_empty()
                .extend(["openai", "deployments", deployment])
                .extend(op.as_path().split('/'));
            url.set_query(None);
            url.query_pairs_mut().append_pair("api-version", api_version);
            Ok(url)
        };
        Ok(Self {
            urls: [
                build(Operation::ChatCompletions)?,
                build(Operation::Completions)?,
                build(Operation::Embeddings)?,
            ],
        })
    }

    fn get(&self, op: Operation) -> &Url {
        &self.urls[op.index()]
    }
}

struct ProxyInner {
    admission: AdmissionFilter,
    cache: Arc<CredentialCache>,
    backend: Arc<dyn Backend>,
    targets: Targets,
    deployment: String,
    scope: String,
    timeouts: Timeouts,
    request_deadline: Duration,
    relay: RelayPolicy,
    channel_capacity: usize,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

/// Entry point for proxied requests. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Wire up the production stack: OAuth2 token source, HTTP backend.
    ///
    /// # Errors
    /// Invalid configuration, or an HTTP client that cannot be built.
    pub fn from_config(cfg: &ProxyConfig, events: Arc<dyn EventSink>) -> Result<Self, InitError> {
        cfg.validate()?;
        let source = OAuthTokenSource::new(&cfg.identity.to_oauth_config()?)?;
        Self::with_token_source(cfg, Arc::new(source), events)
    }

    /// Like [`from_config`](Self::from_config) with a caller-provided
    /// identity provider.
    ///
    /// # Errors
    /// Invalid configuration, or an HTTP client that cannot be built.
    pub fn with_token_source(
        cfg: &ProxyConfig,
        source: Arc<dyn TokenSource>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, InitError> {
        let cache = Arc::new(CredentialCache::new(
            source,
            cfg.identity.safety_margin,
            Arc::clone(&events),
        ));
        let client = HttpClientBuilder::with_config(cfg.backend.http_config()).build()?;
        let backend = Arc::new(HttpBackend::new(
            client,
            Arc::clone(&cache),
            Arc::clone(&events),
        ));
        Self::with_backend(cfg, cache, backend, events).map_err(InitError::from)
    }

    /// Assemble from ready-made parts.
    ///
    /// # Errors
    /// `ConfigError` for settings that fail validation.
    pub fn with_backend(
        cfg: &ProxyConfig,
        cache: Arc<CredentialCache>,
        backend: Arc<dyn Backend>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let admission = AdmissionFilter::from_config(&cfg.admission)?;
        let targets = Targets::new(
            &cfg.backend.endpoint,
            &cfg.backend.deployment,
            &cfg.backend.api_version,
        )?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                admission,
                cache,
                backend,
                targets,
                deployment: cfg.backend.deployment.clone(),
                scope: cfg.identity.scope.clone(),
                timeouts: Timeouts {
                    request: cfg.backend.request_timeout,
                    idle_read: cfg.backend.idle_read_timeout,
                },
                request_deadline: cfg.backend.request_deadline,
                relay: RelayPolicy::from_config(&cfg.relay),
                channel_capacity: cfg.relay.channel_capacity.max(1),
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Cancelling this token ends every open stream without further retries.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    #[must_use]
    pub fn deployment(&self) -> &str {
        &self.inner.deployment
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.inner.cache
    }

    #[must_use]
    pub fn requires_key(&self) -> bool {
        self.inner.admission.requires_key()
    }

    #[must_use]
    pub fn target_url(&self, op: Operation) -> &Url {
        self.inner.targets.get(op)
    }

    /// Run admission, reporting a rejection as an event.
    ///
    /// # Errors
    /// `AdmissionDenied` with the first failing check.
    pub fn admit(&self, req: &AdmissionRequest<'_>) -> Result<(), AdmissionDenied> {
        let decision = self.inner.admission.check(req);
        decision.into_result().inspect_err(|denied| {
            self.inner.events.emit(ProxyEvent::AdmissionRejected {
                reason: denied.reason,
                client: self.inner.admission.client_address(req),
            });
        })
    }

    /// # Errors
    /// Admission, credential or backend failures, each mapped by
    /// [`ProxyError`]'s response conversion. Failures after a stream has
    /// started are reported in-band instead.
    pub async fn handle(&self, req: IncomingRequest) -> Result<ProxyResponse, ProxyError> {
        self.admit(&AdmissionRequest {
            method: &req.method,
            headers: &req.headers,
            peer: req.peer,
            body: &req.body,
        })?;

        let dispatch = Dispatch {
            url: self.inner.targets.get(req.operation).clone(),
            streaming: wants_stream(&req.headers, &req.body),
            headers: forwarded_headers(&req.headers),
            body: req.body,
        };

        if dispatch.streaming {
            self.stream(dispatch).await
        } else {
            self.buffered(dispatch).await
        }
    }

    async fn buffered(&self, dispatch: Dispatch) -> Result<ProxyResponse, ProxyError> {
        let deadline = self.inner.request_deadline;
        let Ok(result) = tokio::time::timeout(deadline, self.inner.dispatch(&dispatch)).await
        else {
            let err = BackendError::new(
                BackendErrorKind::Timeout,
                format!("no complete response within {}ms", deadline.as_millis()),
            );
            self.inner.events.emit(ProxyEvent::BackendFailed {
                kind: err.kind,
                message: err.message.clone(),
            });
            return Err(err.into());
        };
        match result? {
            BackendResponse::Buffered {
                status,
                headers,
                body,
            } => Ok(ProxyResponse::Buffered {
                status,
                headers: response_headers(&headers),
                body,
            }),
            // Only returned for streaming requests.
            BackendResponse::Stream(_) => Err(BackendError::new(
                BackendErrorKind::InvalidResponse,
                "unexpected stream for a buffered request",
            )
            .into()),
        }
    }

    async fn stream(&self, dispatch: Dispatch) -> Result<ProxyResponse, ProxyError> {
        let first = match self.inner.dispatch(&dispatch).await {
            Ok(BackendResponse::Stream(chunks)) => Ok(chunks),
            Ok(BackendResponse::Buffered {
                status,
                headers,
                body,
            }) => {
                return Ok(ProxyResponse::Buffered {
                    status,
                    headers: response_headers(&headers),
                    body,
                });
            }
            Err(ProxyError::Backend(e)) if e.is_retryable() => Err(e),
            Err(e) => return Err(e),
        };

        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        let attempts = Arc::new(Attempts {
            inner: Arc::clone(&self.inner),
            dispatch,
        });
        let join = RelaySession::new(
            tx,
            attempts,
            self.inner.relay.clone(),
            self.inner.shutdown.child_token(),
            Arc::clone(&self.inner.events),
        )
        .with_first_attempt(first)
        .spawn();
        Ok(ProxyResponse::Stream(RelayHandle { rx, join }))
    }

    /// Fetch a token and send a minimal chat request to the deployment.
    ///
    /// # Errors
    /// Whatever keeps the round trip from succeeding with a 2xx.
    pub async fn validate_backend(&self) -> Result<(), ProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let dispatch = Dispatch {
            url: self.inner.targets.get(Operation::ChatCompletions).clone(),
            headers,
            body: Bytes::from_static(
                br#"{"messages":[{"role":"user","content":"ping"}],"max_tokens":5}"#,
            ),
            streaming: false,
        };
        match self.buffered(dispatch).await? {
            ProxyResponse::Buffered { status, .. } if status.is_success() => Ok(()),
            ProxyResponse::Buffered { status, .. } => Err(BackendError::new(
                BackendErrorKind::InvalidResponse,
                format!("deployment probe answered {status}"),
            )
            .into()),
            ProxyResponse::Stream(_) => Ok(()),
        }
    }

    /// OpenAI-style model list with the configured deployment.
    #[must_use]
    pub fn models(&self) -> serde_json::Value {
        serde_json::json!({
            "object": "list",
            "data": [{
                "id": self.inner.deployment,
                "object": "model",
                "created": 1_677_610_602,
                "owned_by": "azure-openai",
            }],
        })
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("deployment", &self.inner.deployment)
            .field("scope", &self.inner.scope)
            .field("admission", &self.inner.admission)
            .finish_non_exhaustive()
    }
}

/// What every attempt of one request sends.
#[derive(Debug, Clone)]
struct Dispatch {
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    streaming: bool,
}

impl ProxyInner {
    /// One backend call, re-sent once with a fresh token after `Unauthorized`.
    async fn dispatch(&self, dispatch: &Dispatch) -> Result<BackendResponse, ProxyError> {
        let mut reauthorized = false;
        loop {
            let credential = self.cache.get_token(&self.scope).await?;
            let request = BackendRequest::new(
                Method::POST,
                dispatch.url.clone(),
                dispatch.headers.clone(),
                dispatch.body.clone(),
                dispatch.streaming,
                self.timeouts,
                Arc::clone(&credential),
            )?;
            match self.backend.send(&request).await {
                Err(e) if e.kind == BackendErrorKind::Unauthorized && !reauthorized => {
                    self.cache.invalidate_stale(&credential);
                    reauthorized = true;
                }
                other => return other.map_err(ProxyError::from),
            }
        }
    }
}

struct Attempts {
    inner: Arc<ProxyInner>,
    dispatch: Dispatch,
}

#[async_trait]
impl AttemptSource for Attempts {
    async fn open(&self, attempt: u32) -> Result<ChunkStream, BackendError> {
        tracing::debug!(attempt, "opening stream attempt");
        match self.inner.dispatch(&self.dispatch).await {
            Ok(BackendResponse::Stream(chunks)) => Ok(chunks),
            Ok(BackendResponse::Buffered { status, .. }) => Err(BackendError::new(
                BackendErrorKind::InvalidResponse,
                format!("backend answered {status} instead of a stream"),
            )),
            Err(ProxyError::Backend(e)) => Err(e),
            Err(ProxyError::Auth(AuthError::RefreshFailed { message, .. })) => {
                tracing::warn!(attempt, error = %message, "token refresh failed mid-stream");
                Err(BackendError::new(
                    BackendErrorKind::Unauthorized,
                    CREDENTIALS_UNAVAILABLE,
                ))
            }
            Err(ProxyError::Admission(denied)) => Err(BackendError::new(
                BackendErrorKind::InvalidResponse,
                denied.to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct StreamFlag {
    #[serde(default)]
    stream: Option<serde_json::Value>,
}

fn wants_stream(headers: &HeaderMap, body: &Bytes) -> bool {
    let accepts_sse = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"));
    accepts_sse
        || serde_json::from_slice::<StreamFlag>(body)
            .is_ok_and(|flag| matches!(flag.stream, Some(serde_json::Value::Bool(true))))
}

fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in FORWARDED_HEADERS {
        let name = HeaderName::from_static(name);
        for value in inbound.get_all(&name) {
            out.append(name.clone(), value.clone());
        }
    }
    if !out.contains_key(CONTENT_TYPE) {
        out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    out
}

fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = upstream.clone();
    for name in HOP_BY_HOP {
        out.remove(name);
    }
    out
}
