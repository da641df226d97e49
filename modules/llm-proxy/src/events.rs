//! Proxy lifecycle events.
//!
//! Components report what happened through an [`EventSink`]; the default
//! sink turns events into structured `tracing` records. Tokens never appear
//! in events, only scopes and expiry times.

use std::net::IpAddr;
use std::time::Duration;

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::error::{BackendErrorKind, DenyReason};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyEvent {
    AdmissionRejected {
        reason: DenyReason,
        client: Option<IpAddr>,
    },
    TokenRefreshed {
        scope: String,
        expires_at: OffsetDateTime,
    },
    TokenRefreshFailed {
        scope: String,
        message: String,
    },
    CredentialInvalidated {
        scope: String,
    },
    BackendFailed {
        kind: BackendErrorKind,
        message: String,
    },
    RetryScheduled {
        /// The attempt that is about to start (2 for the first retry).
        attempt: u32,
        delay: Duration,
        kind: BackendErrorKind,
    },
    StreamCompleted {
        attempts: u32,
        events: u64,
    },
    StreamCancelled {
        attempts: u32,
    },
    TerminalFailure {
        attempts: u32,
        code: &'static str,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProxyEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ProxyEvent) {
        match event {
            ProxyEvent::AdmissionRejected { reason, client } => {
                tracing::warn!(reason = reason.as_str(), client = ?client, "request rejected");
            }
            ProxyEvent::TokenRefreshed { scope, expires_at } => {
                tracing::info!(%scope, %expires_at, "access token refreshed");
            }
            ProxyEvent::TokenRefreshFailed { scope, message } => {
                tracing::error!(%scope, error = %message, "access token refresh failed");
            }
            ProxyEvent::CredentialInvalidated { scope } => {
                tracing::warn!(%scope, "cached credential invalidated after backend rejection");
            }
            ProxyEvent::BackendFailed { kind, message } => {
                tracing::warn!(kind = kind.as_str(), error = %message, "backend call failed");
            }
            ProxyEvent::RetryScheduled {
                attempt,
                delay,
                kind,
            } => {
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    kind = kind.as_str(),
                    "retrying stream"
                );
            }
            ProxyEvent::StreamCompleted { attempts, events } => {
                tracing::debug!(attempts, events, "stream completed");
            }
            ProxyEvent::StreamCancelled { attempts } => {
                tracing::info!(attempts, "stream cancelled");
            }
            ProxyEvent::TerminalFailure { attempts, code } => {
                tracing::error!(attempts, code, "stream failed");
            }
        }
    }
}

/// Keeps events in memory; for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ProxyEvent>>,
}

impl MemoryEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&ProxyEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: ProxyEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryEventSink::new();
        sink.emit(ProxyEvent::CredentialInvalidated { scope: "s".into() });
        sink.emit(ProxyEvent::StreamCancelled { attempts: 2 });
        assert_eq!(
            sink.events(),
            vec![
                ProxyEvent::CredentialInvalidated { scope: "s".into() },
                ProxyEvent::StreamCancelled { attempts: 2 },
            ]
        );
        assert_eq!(
            sink.count(|e| matches!(e, ProxyEvent::StreamCancelled { .. })),
            1
        );
    }

    #[test]
    fn tracing_sink_accepts_every_variant() {
        let sink = TracingEventSink;
        sink.emit(ProxyEvent::AdmissionRejected {
            reason: DenyReason::InvalidKey,
            client: None,
        });
        sink.emit(ProxyEvent::RetryScheduled {
            attempt: 2,
            delay: Duration::from_millis(250),
            kind: BackendErrorKind::Timeout,
        });
        sink.emit(ProxyEvent::TerminalFailure {
            attempts: 3,
            code: "relay_attempts_exhausted",
        });
    }
}
