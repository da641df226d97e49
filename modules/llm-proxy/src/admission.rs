//! Request admission: client key, source address, body shape, rate.
//!
//! Checks run in that order and stop at the first failure. The rate bucket
//! is consulted last so that requests rejected for other reasons do not
//! spend quota.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use azproxy_utils::SecretString;
use bytes::Bytes;
use governor::clock::Clock;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::{HeaderMap, Method, header::AUTHORIZATION};
use ipnet::IpNet;
use subtle::ConstantTimeEq;

use crate::config::{AdmissionConfig, RateLimitConfig};
use crate::error::{AdmissionDenied, ConfigError, DenyReason};

const API_KEY_HEADERS: [&str; 2] = ["api-key", "x-api-key"];
const FORWARDED_FOR: &str = "x-forwarded-for";

/// What admission looks at.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
    /// Socket peer address.
    pub peer: Option<IpAddr>,
    pub body: &'a Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<DenyReason>,
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    const ALLOW: Self = Self {
        allowed: true,
        reason: None,
        retry_after: None,
    };

    fn deny(reason: DenyReason) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            retry_after: None,
        }
    }

    /// `Err` for a denial, for use with `?`.
    ///
    /// # Errors
    /// `AdmissionDenied` carrying the reason.
    pub fn into_result(self) -> Result<(), AdmissionDenied> {
        match self.reason {
            Some(reason) if !self.allowed => Err(AdmissionDenied {
                reason,
                retry_after: self.retry_after,
            }),
            _ => Ok(()),
        }
    }
}

pub struct AdmissionFilter {
    api_key: Option<SecretString>,
    allow_list: Vec<IpNet>,
    trust_forwarded_for: bool,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl AdmissionFilter {
    /// # Errors
    /// `ConfigError` for a malformed allow-list or a zero rate.
    pub fn from_config(cfg: &AdmissionConfig) -> Result<Self, ConfigError> {
        let limiter = cfg.rate_limit.map(build_limiter).transpose()?;
        Ok(Self {
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            allow_list: cfg.parsed_allow_list()?,
            trust_forwarded_for: cfg.trust_forwarded_for,
            limiter,
        })
    }

    #[must_use]
    pub fn requires_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Decide whether `req` may proceed. Only the rate bucket has state.
    #[must_use]
    pub fn check(&self, req: &AdmissionRequest<'_>) -> AdmissionDecision {
        if !self.key_matches(req.headers) {
            return AdmissionDecision::deny(DenyReason::InvalidKey);
        }
        if !self.address_allowed(req) {
            return AdmissionDecision::deny(DenyReason::IpDenied);
        }
        if req.method == Method::POST && !is_json_object(req.body) {
            return AdmissionDecision::deny(DenyReason::InvalidBody);
        }
        if let Some(limiter) = &self.limiter
            && let Err(not_until) = limiter.check()
        {
            return AdmissionDecision {
                retry_after: Some(not_until.wait_time_from(limiter.clock().now())),
                ..AdmissionDecision::deny(DenyReason::RateLimited)
            };
        }
        AdmissionDecision::ALLOW
    }

    fn key_matches(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        presented_key(headers)
            .is_some_and(|key| bool::from(key.as_bytes().ct_eq(expected.expose().as_bytes())))
    }

    fn address_allowed(&self, req: &AdmissionRequest<'_>) -> bool {
        if self.allow_list.is_empty() {
            return true;
        }
        self.client_address(req)
            .is_some_and(|ip| self.allow_list.iter().any(|net| net.contains(&ip)))
    }

    /// Peer address, or the left-most `X-Forwarded-For` hop when trusted.
    #[must_use]
    pub fn client_address(&self, req: &AdmissionRequest<'_>) -> Option<IpAddr> {
        let forwarded = self
            .trust_forwarded_for
            .then(|| forwarded_for(req.headers))
            .flatten();
        forwarded.or(req.peer).map(|ip| ip.to_canonical())
    }
}

impl std::fmt::Debug for AdmissionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionFilter")
            .field("requires_key", &self.api_key.is_some())
            .field("allow_list", &self.allow_list)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

fn build_limiter(rl: RateLimitConfig) -> Result<DefaultDirectRateLimiter, ConfigError> {
    let rps = NonZeroU32::new(rl.rps)
        .ok_or_else(|| ConfigError::invalid("admission.rate_limit.rps", "must be > 0"))?;
    let burst = NonZeroU32::new(rl.burst)
        .ok_or_else(|| ConfigError::invalid("admission.rate_limit.burst", "must be > 0"))?;
    Ok(RateLimiter::direct(Quota::per_second(rps).allow_burst(burst)))
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, rest) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim())
        });
    bearer.or_else(|| {
        API_KEY_HEADERS
            .iter()
            .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
            .map(str::trim)
    })
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let first = headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim();
    first.parse().ok()
}

fn is_json_object(body: &Bytes) -> bool {
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(body).is_ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;

    const BODY: &[u8] = br#"{"messages":[]}"#;

    fn filter(cfg: AdmissionConfig) -> AdmissionFilter {
        AdmissionFilter::from_config(&cfg).unwrap()
    }

    fn keyed() -> AdmissionFilter {
        filter(AdmissionConfig {
            api_key: Some(SecretString::new("sk-proxy-123")),
            ..Default::default()
        })
    }

    fn check(
        f: &AdmissionFilter,
        headers: &HeaderMap,
        peer: &str,
        body: &[u8],
    ) -> AdmissionDecision {
        let body = Bytes::copy_from_slice(body);
        f.check(&AdmissionRequest {
            method: &Method::POST,
            headers,
            peer: Some(peer.parse().unwrap()),
            body: &body,
        })
    }

    fn with(name: &'static str, value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn bearer_and_api_key_headers_accepted() {
        let f = keyed();
        for headers in [
            with("authorization", "Bearer sk-proxy-123"),
            with("authorization", "bearer sk-proxy-123"),
            with("api-key", "sk-proxy-123"),
            with("x-api-key", "sk-proxy-123"),
        ] {
            assert!(check(&f, &headers, "127.0.0.1", BODY).allowed, "{headers:?}");
        }
    }

    #[test]
    fn one_byte_difference_is_rejected() {
        let f = keyed();
        for key in ["sk-proxy-124", "sk-proxy-12", "sk-proxy-1234", ""] {
            let d = check(&f, &with("authorization", &format!("Bearer {key}")), "127.0.0.1", BODY);
            assert_eq!(d.reason, Some(DenyReason::InvalidKey), "{key}");
        }
        let d = check(&f, &HeaderMap::new(), "127.0.0.1", BODY);
        assert_eq!(d.reason, Some(DenyReason::InvalidKey));
    }

    #[test]
    fn no_configured_key_skips_check() {
        let f = filter(AdmissionConfig::default());
        assert!(!f.requires_key());
        assert!(check(&f, &HeaderMap::new(), "10.1.1.1", BODY).allowed);
    }

    #[test]
    fn allow_list_matches_blocks_and_mapped_addresses() {
        let f = filter(AdmissionConfig {
            ip_allow_list: vec!["10.0.0.0/8".into()],
            ..Default::default()
        });
        assert!(check(&f, &HeaderMap::new(), "10.2.3.4", BODY).allowed);
        assert!(check(&f, &HeaderMap::new(), "::ffff:10.2.3.4", BODY).allowed);
        assert_eq!(
            check(&f, &HeaderMap::new(), "192.168.0.1", BODY).reason,
            Some(DenyReason::IpDenied)
        );
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let headers = with("x-forwarded-for", "10.9.9.9, 172.16.0.1");
        let untrusted = filter(AdmissionConfig {
            ip_allow_list: vec!["10.0.0.0/8".into()],
            ..Default::default()
        });
        assert!(!check(&untrusted, &headers, "203.0.113.5", BODY).allowed);

        let trusted = filter(AdmissionConfig {
            ip_allow_list: vec!["10.0.0.0/8".into()],
            trust_forwarded_for: true,
            ..Default::default()
        });
        assert!(check(&trusted, &headers, "203.0.113.5", BODY).allowed);
    }

    #[test]
    fn key_is_checked_before_address() {
        let f = filter(AdmissionConfig {
            api_key: Some(SecretString::new("k")),
            ip_allow_list: vec!["10.0.0.1".into()],
            ..Default::default()
        });
        let d = check(&f, &HeaderMap::new(), "192.0.2.1", BODY);
        assert_eq!(d.reason, Some(DenyReason::InvalidKey));
    }

    #[test]
    fn post_body_must_be_object() {
        let f = filter(AdmissionConfig::default());
        for body in [&b"[]"[..], b"not json", b"\"text\"", b""] {
            let d = check(&f, &HeaderMap::new(), "127.0.0.1", body);
            assert_eq!(d.reason, Some(DenyReason::InvalidBody));
        }
        let get = f.check(&AdmissionRequest {
            method: &Method::GET,
            headers: &HeaderMap::new(),
            peer: None,
            body: &Bytes::new(),
        });
        assert!(get.allowed);
    }

    #[test]
    fn rate_limit_applies_after_other_checks() {
        let f = filter(AdmissionConfig {
            api_key: Some(SecretString::new("k")),
            rate_limit: Some(RateLimitConfig { rps: 1, burst: 2 }),
            ..Default::default()
        });
        let good = with("api-key", "k");
        // Rejected requests do not spend quota.
        for _ in 0..5 {
            check(&f, &HeaderMap::new(), "127.0.0.1", BODY);
        }
        assert!(check(&f, &good, "127.0.0.1", BODY).allowed);
        assert!(check(&f, &good, "127.0.0.1", BODY).allowed);
        let limited = check(&f, &good, "127.0.0.1", BODY);
        assert_eq!(limited.reason, Some(DenyReason::RateLimited));
        assert!(limited.retry_after.is_some());
        assert!(limited.into_result().is_err());
    }
}
