use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::config::CorsConfig;
use crate::error::ConfigError;

/// Build a CORS layer from config.
///
/// # Errors
/// `allow_credentials` together with any `"*"` entry; browsers reject that
/// combination.
pub fn build_cors_layer(cfg: &CorsConfig) -> Result<CorsLayer, ConfigError> {
    let has_wildcard_origin = cfg.allowed_origins.iter().any(|o| o == "*");
    let has_wildcard_rule = cfg
        .allowed_methods
        .iter()
        .chain(&cfg.allowed_headers)
        .any(|v| v == "*");

    if cfg.allow_credentials && (has_wildcard_origin || has_wildcard_rule) {
        return Err(ConfigError::invalid(
            "server.cors.allow_credentials",
            "cannot be combined with '*' origins, methods or headers; list them explicitly",
        ));
    }

    if has_wildcard_origin {
        warn!("CORS allows any origin; list explicit origins for browser-facing deployments");
    }

    let mut layer = CorsLayer::new();

    if has_wildcard_origin {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<http::HeaderValue> = cfg
            .allowed_origins
            .iter()
            .filter_map(|s| http::HeaderValue::from_str(s).ok())
            .collect();
        if !origins.is_empty() {
            layer = layer.allow_origin(origins);
        }
    }

    if cfg.allowed_methods.iter().any(|m| m == "*") {
        layer = layer.allow_methods(Any);
    } else {
        let methods: Vec<http::Method> = cfg
            .allowed_methods
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if !methods.is_empty() {
            layer = layer.allow_methods(methods);
        }
    }

    if cfg.allowed_headers.iter().any(|h| h == "*") {
        layer = layer.allow_headers(Any);
    } else {
        let headers: Vec<http::HeaderName> = cfg
            .allowed_headers
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        if !headers.is_empty() {
            layer = layer.allow_headers(headers);
        }
    }

    if cfg.allow_credentials {
        layer = layer.allow_credentials(true);
    }

    if cfg.max_age_seconds > 0 {
        layer = layer.max_age(std::time::Duration::from_secs(cfg.max_age_seconds));
    }

    Ok(layer)
}
