#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use azproxy_auth::{AcquiredToken, TokenError, TokenSource};
use azproxy_utils::SecretString;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use http::Method;
use httpmock::prelude::*;
use llm_proxy::{
    AdmissionConfig, BackendConfig, IdentityConfig, IncomingRequest, Operation, ProxyConfig,
    RelayConfig,
};

pub const TOKEN_PATH: &str = "/tenant/oauth2/v2.0/token";
pub const CHAT_PATH: &str = "/openai/deployments/gpt-4o/chat/completions";
pub const API_KEY: &str = "sk-proxy-0123456789";

pub fn config(idp: &MockServer, backend: &MockServer) -> ProxyConfig {
    ProxyConfig {
        identity: IdentityConfig {
            token_endpoint: Some(idp.url(TOKEN_PATH)),
            client_id: "app-id".into(),
            client_secret: SecretString::new("app-secret"),
            allow_insecure_http: true,
            ..Default::default()
        },
        backend: BackendConfig {
            endpoint: backend.base_url(),
            deployment: "gpt-4o".into(),
            request_timeout: Duration::from_secs(5),
            idle_read_timeout: Duration::from_secs(5),
            request_deadline: Duration::from_secs(10),
            allow_insecure_http: true,
            ..Default::default()
        },
        admission: AdmissionConfig {
            api_key: Some(SecretString::new(API_KEY)),
            ..Default::default()
        },
        relay: RelayConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn mock_token<'a>(idp: &'a MockServer, token: &str) -> httpmock::Mock<'a> {
    idp.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200).json_body(serde_json::json!({
            "token_type": "Bearer",
            "expires_in": 3600,
            "access_token": token,
        }));
    })
}

pub fn chat_request(key: &str, body: &serde_json::Value) -> IncomingRequest {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}")).unwrap(),
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    IncomingRequest {
        operation: Operation::ChatCompletions,
        method: Method::POST,
        headers,
        peer: Some("127.0.0.1".parse().unwrap()),
        body: Bytes::from(serde_json::to_vec(body).unwrap()),
    }
}

pub fn sse_body(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        out.push_str("data: ");
        out.push_str(part);
        out.push_str("\n\n");
    }
    out
}

/// Hands out `tok-1`, `tok-2`, ... and counts the calls.
#[derive(Default)]
pub struct SequencedTokens {
    calls: AtomicUsize,
}

impl SequencedTokens {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for SequencedTokens {
    async fn fetch_token(&self, _scope: &str) -> Result<AcquiredToken, TokenError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AcquiredToken {
            access_token: SecretString::new(format!("tok-{n}")),
            expires_in: Duration::from_secs(3600),
        })
    }
}
