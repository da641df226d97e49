use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use http::header::AUTHORIZATION;
use url::Url;
use zeroize::Zeroizing;

use crate::config::OAuthClientConfig;
use crate::error::TokenError;
use crate::http_error::format_http_error;
use crate::types::{ClientAuthMethod, TokenResponse};
use azproxy_utils::SecretString;

const ERROR_PREFIX: &str = "token endpoint";

/// A token as handed out by the identity provider.
#[derive(Debug, Clone)]
pub struct AcquiredToken {
    pub access_token: SecretString,
    /// Lifetime counted from the moment the response was received.
    pub expires_in: Duration,
}

/// Something that can mint a bearer token for a scope.
///
/// Implementations do no caching; every call is a round trip.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// # Errors
    /// Any failure to obtain a usable bearer token.
    async fn fetch_token(&self, scope: &str) -> Result<AcquiredToken, TokenError>;
}

/// Client-credentials grant against an `OAuth2` token endpoint.
pub struct OAuthTokenSource {
    client: azproxy_http::HttpClient,
    token_endpoint: Url,
    client_id: String,
    client_secret: SecretString,
    auth_method: ClientAuthMethod,
    extra_headers: Vec<(String, String)>,
    default_ttl: Duration,
}

impl OAuthTokenSource {
    /// # Errors
    /// `TokenError::ConfigError` for an inconsistent config, `TokenError::Http`
    /// if the HTTP client cannot be built.
    pub fn new(config: &OAuthClientConfig) -> Result<Self, TokenError> {
        config.validate()?;
        let token_endpoint = config.resolve_token_endpoint()?;

        let http_config = config
            .http_config
            .clone()
            .unwrap_or_else(azproxy_http::HttpClientConfig::token_endpoint);
        let client = azproxy_http::HttpClientBuilder::with_config(http_config)
            .build()
            .map_err(|e| TokenError::Http(format_http_error(&e, ERROR_PREFIX)))?;

        Ok(Self {
            client,
            token_endpoint,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_method: config.auth_method,
            extra_headers: config.extra_headers.clone(),
            default_ttl: config.default_ttl,
        })
    }

    #[must_use]
    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }
}

impl std::fmt::Debug for OAuthTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenSource")
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("client_id", &self.client_id)
            .field("auth_method", &self.auth_method)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn fetch_token(&self, scope: &str) -> Result<AcquiredToken, TokenError> {
        let mut fields: Vec<(&str, &str)> =
            vec![("grant_type", "client_credentials"), ("scope", scope)];

        let secret_copy;
        if self.auth_method == ClientAuthMethod::Form {
            secret_copy = Zeroizing::new(self.client_secret.expose().to_owned());
            fields.push(("client_id", &self.client_id));
            fields.push(("client_secret", &secret_copy));
        }

        let mut builder = self.client.post(self.token_endpoint.as_str());
        if self.auth_method == ClientAuthMethod::Basic {
            let credentials = Zeroizing::new(format!(
                "{}:{}",
                self.client_id,
                self.client_secret.expose()
            ));
            let encoded = Zeroizing::new(general_purpose::STANDARD.encode(credentials.as_bytes()));
            let value = Zeroizing::new(format!("Basic {}", &*encoded));
            builder = builder.sensitive_header(AUTHORIZATION.as_str(), &value);
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name, value);
        }

        let http_err =
            |e: azproxy_http::HttpError| TokenError::Http(format_http_error(&e, ERROR_PREFIX));
        let body = builder
            .form(fields.as_slice())
            .map_err(http_err)?
            .send()
            .await
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?
            .bytes()
            .await
            .map_err(http_err)?;

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| TokenError::InvalidResponse(format!("malformed JSON: {e}")))?;

        if parsed.access_token.is_empty() {
            return Err(TokenError::InvalidResponse("empty access_token".into()));
        }
        if let Some(ref tt) = parsed.token_type
            && !tt.eq_ignore_ascii_case("bearer")
        {
            return Err(TokenError::UnsupportedTokenType(tt.clone()));
        }

        let expires_in = parsed
            .expires_in
            .map_or(self.default_ttl, Duration::from_secs);
        tracing::debug!(scope, expires_in_secs = expires_in.as_secs(), "access token acquired");

        Ok(AcquiredToken {
            access_token: SecretString::new(parsed.access_token),
            expires_in,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_incomplete_config() {
        let err = OAuthTokenSource::new(&OAuthClientConfig::default()).unwrap_err();
        assert!(matches!(err, TokenError::ConfigError(_)));
    }

    #[tokio::test]
    async fn debug_hides_secret() {
        let source = OAuthTokenSource::new(&OAuthClientConfig {
            client_id: "app".into(),
            client_secret: SecretString::new("very-secret"),
            tenant_id: Some("t".into()),
            ..Default::default()
        })
        .unwrap();
        let rendered = format!("{source:?}");
        assert!(rendered.contains("login.microsoftonline.com/t/oauth2/v2.0/token"));
        assert!(!rendered.contains("very-secret"));
    }
}
