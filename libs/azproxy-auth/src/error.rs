use thiserror::Error;

/// Failure to obtain a token from the identity provider.
///
/// Messages are safe to log: they never carry secrets or response bodies.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    #[error("{0}")]
    Http(String),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("unsupported token type: {0}")]
    UnsupportedTokenType(String),

    #[error("OAuth2 config error: {0}")]
    ConfigError(String),
}
