#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Outbound HTTP client used by azproxy to talk to the identity provider and
//! to the model backend.
//!
//! The client is a tower stack over a pooled hyper client with rustls:
//! - three distinct time limits: TCP/TLS connect, time to response headers,
//!   and idle time between body chunks while streaming
//! - fail-fast buffering so callers never queue unboundedly
//! - default `User-Agent` injection
//! - buffered reads (`bytes`, `json`) capped at `max_body_size`
//! - streamed reads through [`ChunkStream`], which never materialises the body
//!
//! Retries are not part of the stack. Callers that retry (the token cache,
//! the stream relay) do so explicitly with [`calculate_backoff`].
//!
//! ```ignore
//! use azproxy_http::{HttpClient, HttpClientConfig};
//!
//! let client = HttpClient::builder()
//!     .config(HttpClientConfig::streaming())
//!     .build()?;
//!
//! let resp = client
//!     .post("https://example.openai.azure.com/openai/deployments/gpt/chat/completions")
//!     .sensitive_header("authorization", "Bearer ...")
//!     .body_bytes(body)
//!     .send()
//!     .await?;
//! let mut chunks = resp.into_chunk_stream();
//! ```

mod backoff;
mod builder;
mod client;
mod config;
mod error;
mod header_layer;
mod request;
mod response;
mod stream;
mod tls;

pub use backoff::{ExponentialBackoff, calculate_backoff};
pub use builder::HttpClientBuilder;
pub use client::HttpClient;
pub use config::{DEFAULT_USER_AGENT, HttpClientConfig, TlsRootConfig, TransportSecurity};
pub use error::{HttpError, InvalidUriKind};
pub use header_layer::{DefaultHeadersLayer, DefaultHeadersService};
pub use request::RequestBuilder;
pub use response::{HttpResponse, ResponseBody, parse_retry_after};
pub use stream::ChunkStream;
