#![allow(clippy::unwrap_used, clippy::expect_used)]

use azproxy_http::{HttpClient, HttpClientConfig, HttpError, DEFAULT_USER_AGENT};
use futures::StreamExt;
use httpmock::prelude::*;
use serde_json::json;
use std::time::Duration;

fn test_client() -> HttpClient {
    HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .build()
        .unwrap()
}

#[tokio::test]
async fn get_json() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(GET).path("/models");
        then.status(200).json_body(json!({"data": []}));
    });

    let value: serde_json::Value = test_client()
        .get(&format!("{}/models", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(value, json!({"data": []}));
}

#[tokio::test]
async fn post_form_sets_content_type() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(POST)
            .path("/token")
            .header("content-type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials&scope=a+b");
        then.status(200).body("ok");
    });

    let resp = test_client()
        .post(&format!("{}/token", server.base_url()))
        .form(&[("grant_type", "client_credentials"), ("scope", "a b")])
        .unwrap()
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "ok");
    m.assert();
}

#[tokio::test]
async fn default_user_agent_is_sent() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET).path("/ua").header("user-agent", DEFAULT_USER_AGENT);
        then.status(204);
    });

    let resp = test_client()
        .get(&format!("{}/ua", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    m.assert();
}

#[tokio::test]
async fn non_success_is_not_an_error_until_checked() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.method(POST).path("/busy");
        then.status(429).header("retry-after", "3").body("slow down");
    });

    let resp = test_client()
        .post(&format!("{}/busy", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);

    match resp.checked_bytes().await.unwrap_err() {
        HttpError::HttpStatus {
            status,
            body_preview,
            retry_after,
        } => {
            assert_eq!(status, 429);
            assert_eq!(body_preview, "slow down");
            assert_eq!(retry_after, Some(Duration::from_secs(3)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn slow_headers_hit_request_timeout() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.path("/slow");
        then.status(200).delay(Duration::from_millis(500));
    });

    let client = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let err = client
        .get(&format!("{}/slow", server.base_url()))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn refused_connection_is_connection_failure() {
    // Port 9 (discard) is closed on test hosts.
    let err = test_client()
        .get("http://127.0.0.1:9/")
        .send()
        .await
        .unwrap_err();
    assert!(err.is_connection_failure(), "got {err:?}");
}

#[tokio::test]
async fn body_limit_applies_to_buffered_reads() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.path("/big");
        then.status(200).body("x".repeat(2048));
    });

    let client = HttpClient::builder()
        .config(HttpClientConfig::for_testing())
        .max_body_size(1024)
        .build()
        .unwrap();
    let err = client
        .get(&format!("{}/big", server.base_url()))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::BodyTooLarge { limit: 1024, .. }));
}

#[tokio::test]
async fn chunk_stream_reads_whole_body() {
    let server = MockServer::start();
    let body = "data: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n";
    let _m = server.mock(|when, then| {
        when.method(POST).path("/stream");
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(body);
    });

    let resp = test_client()
        .post(&format!("{}/stream", server.base_url()))
        .body_bytes(bytes::Bytes::from_static(b"{\"stream\":true}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    let mut collected = Vec::new();
    let mut chunks = Box::pin(resp.into_chunk_stream());
    while let Some(chunk) = chunks.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(String::from_utf8(collected).unwrap(), body);
}

#[tokio::test]
async fn per_request_timeout_is_tighter_than_client_timeout() {
    let server = MockServer::start();
    let _m = server.mock(|when, then| {
        when.path("/slowish");
        then.status(200).delay(Duration::from_millis(400));
    });

    let err = test_client()
        .get(&format!("{}/slowish", server.base_url()))
        .timeout(Duration::from_millis(50))
        .send()
        .await
        .unwrap_err();
    assert!(matches!(err, HttpError::Timeout(d) if d == Duration::from_millis(50)));
}
