//! Proxy configuration.
//!
//! Every section deserializes with defaults so a YAML file only needs the
//! values that differ. Durations use `azproxy_utils::humantime_serde`.

use std::net::IpAddr;
use std::time::Duration;

use azproxy_auth::ClientAuthMethod;
use azproxy_utils::SecretString;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub identity: IdentityConfig,
    pub backend: BackendConfig,
    pub admission: AdmissionConfig,
    pub relay: RelayConfig,
}

impl ProxyConfig {
    /// Check the values a running proxy cannot do without.
    ///
    /// # Errors
    /// The first problem found, naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate()?;
        self.identity.validate()?;
        self.admission.validate()?;
        self.relay.validate()?;
        if self.server.max_body_bytes == 0 {
            return Err(ConfigError::invalid("server.max_body_bytes", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    pub cors: CorsConfig,
    /// How long in-flight requests get to finish after a shutdown signal.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            max_body_bytes: 4 * 1024 * 1024,
            cors: CorsConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Cross-origin policy. The default allows everything, without credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec!["*".to_owned()],
            allowed_headers: vec!["*".to_owned()],
            allow_credentials: false,
            max_age_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
    /// Identity provider base URL; `None` means the public Microsoft cloud.
    pub authority: Option<String>,
    /// Full token URL, overrides `authority` + `tenant_id`.
    pub token_endpoint: Option<String>,
    pub scope: String,
    pub auth_method: ClientAuthMethod,
    /// Refresh this long before a token expires.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub safety_margin: Duration,
    /// Assumed lifetime when the provider omits `expires_in`.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub default_ttl: Duration,
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub request_timeout: Duration,
    /// Permit an `http://` token endpoint (local mocks).
    pub allow_insecure_http: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            client_secret: SecretString::default(),
            authority: None,
            token_endpoint: None,
            scope: DEFAULT_SCOPE.to_owned(),
            auth_method: ClientAuthMethod::Form,
            safety_margin: Duration::from_secs(60),
            default_ttl: Duration::from_secs(5 * 60),
            request_timeout: Duration::from_secs(30),
            allow_insecure_http: false,
        }
    }
}

impl IdentityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::missing("identity.client_id"));
        }
        if self.client_secret.is_empty() {
            return Err(ConfigError::missing("identity.client_secret"));
        }
        if self.tenant_id.trim().is_empty() && self.token_endpoint.is_none() {
            return Err(ConfigError::missing("identity.tenant_id"));
        }
        if self.scope.trim().is_empty() {
            return Err(ConfigError::missing("identity.scope"));
        }
        for (field, value) in [
            ("identity.authority", &self.authority),
            ("identity.token_endpoint", &self.token_endpoint),
        ] {
            if let Some(url) = value {
                Url::parse(url).map_err(|e| ConfigError::invalid(field, e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Client-credentials settings for [`azproxy_auth::OAuthTokenSource`].
    ///
    /// # Errors
    /// `ConfigError` when a URL does not parse.
    pub fn to_oauth_config(&self) -> Result<azproxy_auth::OAuthClientConfig, ConfigError> {
        let parse = |field: &'static str, value: Option<&str>| {
            value
                .map(Url::parse)
                .transpose()
                .map_err(|e| ConfigError::invalid(field, e.to_string()))
        };
        let tenant = self.tenant_id.trim();
        let mut http = azproxy_http::HttpClientConfig::token_endpoint();
        http.request_timeout = self.request_timeout;
        if self.allow_insecure_http {
            http.transport = azproxy_http::TransportSecurity::AllowInsecureHttp;
        }
        Ok(azproxy_auth::OAuthClientConfig {
            token_endpoint: parse("identity.token_endpoint", self.token_endpoint.as_deref())?,
            tenant_id: (!tenant.is_empty()).then(|| tenant.to_owned()),
            authority: parse("identity.authority", self.authority.as_deref())?,
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            auth_method: self.auth_method,
            default_ttl: self.default_ttl,
            http_config: Some(http),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub connect_timeout: Duration,
    /// Time until response headers.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub request_timeout: Duration,
    /// Longest silence between two chunks of a streamed response.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub idle_read_timeout: Duration,
    /// Upper bound for a whole non-streaming exchange.
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub request_deadline: Duration,
    pub max_response_bytes: usize,
    /// Fetch a token and probe the deployment before accepting traffic.
    pub validate_on_startup: bool,
    /// Permit an `http://` endpoint (local mocks).
    pub allow_insecure_http: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            deployment: String::new(),
            api_version: "2024-02-01".to_owned(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            idle_read_timeout: Duration::from_secs(30),
            request_deadline: Duration::from_secs(120),
            max_response_bytes: 16 * 1024 * 1024,
            validate_on_startup: false,
            allow_insecure_http: false,
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::missing("backend.endpoint"));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ConfigError::invalid("backend.endpoint", e.to_string()))?;
        match url.scheme() {
            "https" => {}
            "http" if self.allow_insecure_http => {}
            other => {
                return Err(ConfigError::invalid(
                    "backend.endpoint",
                    format!("scheme '{other}' not allowed"),
                ));
            }
        }
        if self.deployment.trim().is_empty() {
            return Err(ConfigError::missing("backend.deployment"));
        }
        if self.api_version.trim().is_empty() {
            return Err(ConfigError::missing("backend.api_version"));
        }
        Ok(())
    }

    /// Outbound client settings for the model backend.
    #[must_use]
    pub fn http_config(&self) -> azproxy_http::HttpClientConfig {
        let mut cfg = azproxy_http::HttpClientConfig::streaming();
        cfg.connect_timeout = self.connect_timeout;
        cfg.request_timeout = self.request_timeout;
        cfg.idle_read_timeout = Some(self.idle_read_timeout);
        cfg.max_body_size = self.max_response_bytes;
        if self.allow_insecure_http {
            cfg.transport = azproxy_http::TransportSecurity::AllowInsecureHttp;
        }
        cfg
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Key clients must present. `None` disables the check.
    pub api_key: Option<SecretString>,
    /// Addresses or CIDR blocks; empty allows everyone.
    pub ip_allow_list: Vec<String>,
    /// Take the client address from the left-most `X-Forwarded-For` entry.
    pub trust_forwarded_for: bool,
    pub rate_limit: Option<RateLimitConfig>,
}

impl AdmissionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_allow_list()?;
        if let Some(rl) = &self.rate_limit
            && (rl.rps == 0 || rl.burst == 0)
        {
            return Err(ConfigError::invalid(
                "admission.rate_limit",
                "rps and burst must be > 0",
            ));
        }
        Ok(())
    }

    /// Allow-list entries as networks; a bare address becomes a host route.
    ///
    /// # Errors
    /// `ConfigError` naming the first entry that is neither.
    pub fn parsed_allow_list(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.ip_allow_list
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| {
                        ConfigError::invalid(
                            "admission.ip_allow_list",
                            format!("'{entry}' is not an IP address or CIDR block"),
                        )
                    })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub rps: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Attempts per streaming request, the first one included.
    pub max_attempts: u32,
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "azproxy_utils::humantime_serde")]
    pub max_delay: Duration,
    pub jitter: bool,
    /// Events buffered between the relay and a slow client.
    pub channel_capacity: usize,
    /// Longest upstream SSE event accepted before the stream is failed.
    pub max_event_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            jitter: true,
            channel_capacity: 16,
            max_event_bytes: crate::sse::DEFAULT_MAX_EVENT_BYTES,
        }
    }
}

impl RelayConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("relay.max_attempts", "must be >= 1"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::invalid("relay.channel_capacity", "must be >= 1"));
        }
        if self.max_event_bytes == 0 {
            return Err(ConfigError::invalid("relay.max_event_bytes", "must be > 0"));
        }
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "relay.base_delay",
                "must not exceed relay.max_delay",
            ));
        }
        Ok(())
    }
}
