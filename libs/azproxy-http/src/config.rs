use std::time::Duration;

/// Default User-Agent string for outbound requests
pub const DEFAULT_USER_AGENT: &str = concat!("azproxy/", env!("CARGO_PKG_VERSION"));

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Mozilla roots bundled with webpki-roots
    #[default]
    WebPki,
    /// OS certificate store
    Native,
}

/// Whether plain `http://` URLs are accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportSecurity {
    #[default]
    TlsOnly,
    /// Local mock servers only.
    AllowInsecureHttp,
}

/// Outbound client configuration.
///
/// The three timeouts are independent: `connect_timeout` bounds TCP + TLS
/// setup, `request_timeout` bounds the wait for response headers, and
/// `idle_read_timeout` bounds the gap between two body chunks of a streamed
/// response. None of them bounds the total length of a healthy stream.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// TCP connect + TLS handshake limit (default: 10 s)
    pub connect_timeout: Duration,

    /// Time to response headers (default: 30 s)
    pub request_timeout: Duration,

    /// Maximum silence between body chunks of a streamed response (default: 30 s).
    /// `None` disables the check.
    pub idle_read_timeout: Option<Duration>,

    /// Cap for buffered body reads (default: 10 MB)
    pub max_body_size: usize,

    pub user_agent: String,

    pub transport: TransportSecurity,

    pub tls_roots: TlsRootConfig,

    /// Requests that may wait for the buffer worker (default: 1024)
    pub buffer_capacity: usize,

    /// Idle pooled connections are closed after this (default: 90 s)
    pub pool_idle_timeout: Option<Duration>,

    /// Idle connections kept per host (default: 32)
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            idle_read_timeout: Some(Duration::from_secs(30)),
            max_body_size: 10 * 1024 * 1024,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            transport: TransportSecurity::TlsOnly,
            tls_roots: TlsRootConfig::default(),
            buffer_capacity: 1024,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}

impl HttpClientConfig {
    /// Identity provider token endpoint: small bodies, few connections.
    #[must_use]
    pub fn token_endpoint() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            idle_read_timeout: None,
            max_body_size: 1024 * 1024,
            buffer_capacity: 256,
            pool_idle_timeout: Some(Duration::from_secs(60)),
            pool_max_idle_per_host: 4,
            ..Self::default()
        }
    }

    /// Model backend: long generations, streamed bodies.
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            idle_read_timeout: Some(Duration::from_secs(30)),
            max_body_size: 16 * 1024 * 1024,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 64,
            ..Self::default()
        }
    }

    /// Plain HTTP and short limits, for mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            idle_read_timeout: Some(Duration::from_secs(10)),
            max_body_size: 1024 * 1024,
            transport: TransportSecurity::AllowInsecureHttp,
            buffer_capacity: 64,
            pool_idle_timeout: Some(Duration::from_secs(10)),
            pool_max_idle_per_host: 4,
            ..Self::default()
        }
    }
}
