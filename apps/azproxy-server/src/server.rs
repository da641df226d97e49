use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use llm_proxy::{Proxy, TracingEventSink, router};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::signals;

/// Serve until a shutdown signal, then drain within `server.shutdown_timeout`.
///
/// # Errors
/// Invalid configuration, a failed startup probe, or a listener that cannot
/// be bound.
pub async fn run(config: &AppConfig) -> Result<()> {
    let proxy_cfg = config.proxy();
    let proxy = Proxy::from_config(&proxy_cfg, Arc::new(TracingEventSink))
        .context("failed to initialise the proxy")?;

    if !proxy.requires_key() {
        tracing::warn!("admission.api_key is not set; every client is admitted");
    }

    if proxy_cfg.backend.validate_on_startup {
        let expires_at = proxy
            .credentials()
            .prewarm(proxy.scope())
            .await
            .context("could not obtain an access token")?;
        tracing::info!(%expires_at, "access token acquired");
        proxy
            .validate_backend()
            .await
            .with_context(|| format!("deployment '{}' failed the probe", proxy.deployment()))?;
        tracing::info!(deployment = proxy.deployment(), "backend validated");
    }

    let app = router(proxy.clone(), &proxy_cfg.server).context("failed to build the router")?;

    let host = proxy_cfg.server.host.as_str();
    let port = proxy_cfg.server.port;
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        deployment = proxy.deployment(),
        "azproxy listening"
    );

    let root = CancellationToken::new();
    signals::cancel_on_signal(root.clone());

    let shutdown = {
        let root = root.clone();
        let streams = proxy.shutdown_token().clone();
        async move {
            root.cancelled().await;
            // Open relays end their streams so their connections can close.
            streams.cancel();
        }
    };

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .into_future();

    let drain_limit = proxy_cfg.server.shutdown_timeout;
    let drain_deadline = async {
        root.cancelled().await;
        tokio::time::sleep(drain_limit).await;
    };

    tokio::select! {
        result = serve => result.context("HTTP server failed")?,
        () = drain_deadline => {
            tracing::warn!(
                timeout_ms = u64::try_from(drain_limit.as_millis()).unwrap_or(u64::MAX),
                "shutdown timeout elapsed, dropping remaining connections"
            );
        }
    }
    tracing::info!("azproxy stopped");
    Ok(())
}

/// Validate the configuration and fetch one token.
///
/// # Errors
/// Invalid configuration or an identity provider that refuses the client.
pub async fn check(config: &AppConfig) -> Result<()> {
    let proxy_cfg = config.proxy();
    proxy_cfg.validate().context("invalid configuration")?;
    let proxy = Proxy::from_config(&proxy_cfg, Arc::new(TracingEventSink))
        .context("failed to initialise the proxy")?;
    let expires_at = proxy
        .credentials()
        .prewarm(proxy.scope())
        .await
        .context("could not obtain an access token")?;

    println!("Configuration is valid");
    println!(
        "Token for scope '{}' acquired, valid until {expires_at}",
        proxy.scope()
    );
    Ok(())
}
