use std::fmt;
use std::time::Duration;
use url::Url;

use crate::error::TokenError;
use crate::types::ClientAuthMethod;
use azproxy_utils::SecretString;

/// Microsoft identity platform, public cloud.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Client-credentials configuration for the identity provider.
///
/// The token endpoint is either given directly or derived from
/// `authority` and `tenant_id` as `{authority}/{tenant_id}/oauth2/v2.0/token`.
/// `Debug` redacts the secret and extra header values.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_endpoint: Option<Url>,
    pub tenant_id: Option<String>,
    /// `None` means [`DEFAULT_AUTHORITY`].
    pub authority: Option<Url>,
    pub client_id: String,
    pub client_secret: SecretString,
    pub auth_method: ClientAuthMethod,
    /// Extra headers sent with every token request.
    pub extra_headers: Vec<(String, String)>,
    /// Lifetime assumed when the response has no `expires_in` (default: 5 min).
    pub default_ttl: Duration,
    /// `None` uses [`HttpClientConfig::token_endpoint`](azproxy_http::HttpClientConfig::token_endpoint).
    pub http_config: Option<azproxy_http::HttpClientConfig>,
}

impl OAuthClientConfig {
    /// # Errors
    /// `TokenError::ConfigError` when credentials are blank or no endpoint
    /// can be derived.
    pub fn validate(&self) -> Result<(), TokenError> {
        if self.client_id.trim().is_empty() {
            return Err(TokenError::ConfigError("client_id must not be empty".into()));
        }
        if self.client_secret.is_empty() {
            return Err(TokenError::ConfigError(
                "client_secret must not be empty".into(),
            ));
        }
        self.resolve_token_endpoint().map(|_| ())
    }

    /// The URL token requests are posted to.
    ///
    /// # Errors
    /// `TokenError::ConfigError` when neither an endpoint nor a tenant is set.
    pub fn resolve_token_endpoint(&self) -> Result<Url, TokenError> {
        if let Some(endpoint) = &self.token_endpoint {
            return Ok(endpoint.clone());
        }
        let tenant = self
            .tenant_id
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                TokenError::ConfigError("either token_endpoint or tenant_id must be set".into())
            })?;

        let mut url = match &self.authority {
            Some(authority) => authority.clone(),
            None => Url::parse(DEFAULT_AUTHORITY)
                .map_err(|e| TokenError::ConfigError(format!("invalid authority: {e}")))?,
        };
        url.path_segments_mut()
            .map_err(|()| TokenError::ConfigError("authority cannot be a base URL".into()))?
            .pop_if_empty()
            .extend([tenant, "oauth2", "v2.0", "token"]);
        Ok(url)
    }
}

impl fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<_> = self
            .extra_headers
            .iter()
            .map(|(k, _)| (k.as_str(), "[REDACTED]"))
            .collect();
        f.debug_struct("OAuthClientConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("tenant_id", &self.tenant_id)
            .field("authority", &self.authority.as_ref().map(Url::as_str))
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("auth_method", &self.auth_method)
            .field("extra_headers", &headers)
            .field("default_ttl", &self.default_ttl)
            .field("http_config", &self.http_config)
            .finish()
    }
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            token_endpoint: None,
            tenant_id: None,
            authority: None,
            client_id: String::new(),
            client_secret: SecretString::default(),
            auth_method: ClientAuthMethod::default(),
            extra_headers: Vec::new(),
            default_ttl: Duration::from_secs(5 * 60),
            http_config: None,
        }
    }
}
