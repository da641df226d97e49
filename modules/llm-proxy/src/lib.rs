#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Authenticating reverse proxy for Azure `OpenAI` deployments.
//!
//! Clients speak the `OpenAI` wire format with a proxy API key. The proxy
//! admits the request, attaches an Azure AD bearer token from the
//! [`CredentialCache`], forwards the call to the configured deployment and
//! either returns the buffered answer or relays the server-sent event stream
//! through a [`RelaySession`] that retries interrupted attempts.

pub mod admission;
pub mod backend;
pub mod config;
pub mod cors;
pub mod credential;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod relay;
pub mod routes;
pub mod sse;

pub use admission::{AdmissionDecision, AdmissionFilter, AdmissionRequest};
pub use backend::{Backend, BackendRequest, BackendResponse, ChunkStream, HttpBackend, Timeouts};
pub use config::{
    AdmissionConfig, BackendConfig, CorsConfig, DEFAULT_SCOPE, IdentityConfig, ProxyConfig,
    RateLimitConfig, RelayConfig, ServerConfig,
};
pub use credential::{Credential, CredentialCache};
pub use error::{
    AdmissionDenied, AuthError, BackendError, BackendErrorKind, ConfigError, DenyReason,
    ErrorBody, InitError, ProxyError, RelayFailed,
};
pub use events::{EventSink, MemoryEventSink, ProxyEvent, TracingEventSink};
pub use orchestrator::{IncomingRequest, Operation, Proxy, ProxyResponse};
pub use relay::{
    AttemptSource, RelayHandle, RelayOutcome, RelayPolicy, RelaySession, RelayState,
};
pub use routes::{SERVICE_NAME, router};
