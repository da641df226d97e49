use crate::config::{HttpClientConfig, TlsRootConfig, TransportSecurity};
use crate::error::HttpError;
use crate::header_layer::DefaultHeadersLayer;
use crate::response::ResponseBody;
use crate::tls;
use bytes::Bytes;
use http::Response;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::{ServiceBuilder, ServiceExt};

/// Builder for [`HttpClient`](crate::HttpClient).
#[derive(Debug, Clone, Default)]
pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self { config }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: HttpClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Time allowed until response headers arrive.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Longest gap allowed between two chunks of a streamed body.
    #[must_use]
    pub fn idle_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_read_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: TransportSecurity) -> Self {
        self.config.transport = transport;
        self
    }

    /// Accept `http://` URLs. Only available in debug builds or with the
    /// `allow-insecure-http` feature.
    #[must_use]
    #[cfg(any(debug_assertions, feature = "allow-insecure-http"))]
    pub fn allow_insecure_http(mut self) -> Self {
        self.config.transport = TransportSecurity::AllowInsecureHttp;
        self
    }

    /// Zero is clamped to 1; `tower::buffer::Buffer` panics on 0.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Build the client.
    ///
    /// Stack, outer to inner: `Buffer → error mapping → Timeout →
    /// DefaultHeaders → hyper client`. The timeout covers connect, TLS and
    /// the wait for headers; body reads are governed by the idle timeout in
    /// [`ChunkStream`](crate::ChunkStream) and by the caller.
    ///
    /// # Errors
    /// `HttpError::Tls` when native roots are requested but unusable,
    /// `HttpError::InvalidHeaderValue` for a bad user agent.
    pub fn build(self) -> Result<crate::HttpClient, HttpError> {
        if self.config.transport == TransportSecurity::AllowInsecureHttp {
            tracing::warn!("insecure HTTP enabled; use only against local mock servers");
        }

        let request_timeout = self.config.request_timeout;
        let https = build_https_connector(
            self.config.tls_roots,
            self.config.transport,
            self.config.connect_timeout,
        )?;

        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host);
        if let Some(idle) = self.config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle);
        }
        let hyper_client = client_builder.build::<_, Full<Bytes>>(https);

        let headers = DefaultHeadersLayer::user_agent(&self.config.user_agent)?;

        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(request_timeout))
            .layer(headers)
            .service(hyper_client)
            .map_response(box_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, request_timeout))
            .boxed_clone();

        let buffered: crate::client::BufferedService =
            Buffer::new(service, self.config.buffer_capacity.max(1));

        Ok(crate::HttpClient {
            service: buffered,
            max_body_size: self.config.max_body_size,
            transport_security: self.config.transport,
            idle_read_timeout: self.config.idle_read_timeout,
        })
    }
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    let err = match err.downcast::<hyper_util::client::legacy::Error>() {
        Ok(client_err) => return HttpError::from(*client_err),
        Err(other) => other,
    };
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

fn build_https_connector(
    tls_roots: TlsRootConfig,
    transport: TransportSecurity,
    connect_timeout: Duration,
) -> Result<HttpsConnector<HttpConnector>, HttpError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(connect_timeout));
    http.set_nodelay(true);

    let allow_http = transport == TransportSecurity::AllowInsecureHttp;
    let builder = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(tls::crypto_provider())
            .map_err(|e| HttpError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => {
            let client_config =
                tls::native_roots_client_config().map_err(|e| HttpError::Tls(e.into()))?;
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(client_config)
        }
    };

    let connector = if allow_http {
        builder
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http)
    } else {
        builder
            .https_only()
            .enable_all_versions()
            .wrap_connector(http)
    };
    Ok(connector)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn buffer_capacity_zero_is_clamped() {
        let builder = HttpClientBuilder::new().buffer_capacity(0);
        assert_eq!(builder.config.buffer_capacity, 1);
    }

    #[test]
    fn setters_update_config() {
        let builder = HttpClientBuilder::new()
            .timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_secs(1))
            .idle_read_timeout(None)
            .max_body_size(42)
            .user_agent("probe/1");
        assert_eq!(builder.config.request_timeout, Duration::from_secs(3));
        assert_eq!(builder.config.connect_timeout, Duration::from_secs(1));
        assert!(builder.config.idle_read_timeout.is_none());
        assert_eq!(builder.config.max_body_size, 42);
        assert_eq!(builder.config.user_agent, "probe/1");
    }

    #[tokio::test]
    async fn invalid_user_agent_fails_build() {
        let err = HttpClientBuilder::new()
            .user_agent("bad\r\nagent")
            .build()
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeaderValue(_)));
    }

    #[tokio::test]
    async fn elapsed_maps_to_timeout() {
        let err: tower::BoxError = Box::new(tower::timeout::error::Elapsed::new());
        assert!(matches!(
            map_tower_error(err, Duration::from_secs(9)),
            HttpError::Timeout(d) if d == Duration::from_secs(9)
        ));
    }

    #[tokio::test]
    async fn builds_with_insecure_http() {
        let client = HttpClientBuilder::new().allow_insecure_http().build().unwrap();
        assert_eq!(
            client.transport_security,
            TransportSecurity::AllowInsecureHttp
        );
    }
}
