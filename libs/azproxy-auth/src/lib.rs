#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Access tokens for the model backend, obtained from the identity provider
//! with the `OAuth2` client-credentials grant.
//!
//! [`TokenSource`] is the seam the credential cache depends on;
//! [`OAuthTokenSource`] is the production implementation.

pub mod config;
pub mod error;
pub mod http_error;
mod source;
pub mod types;

pub use config::{DEFAULT_AUTHORITY, OAuthClientConfig};
pub use error::TokenError;
pub use http_error::format_http_error;
pub use source::{AcquiredToken, OAuthTokenSource, TokenSource};
pub use types::ClientAuthMethod;
