//! Streams a backend response to one client, retrying interrupted attempts.
//!
//! A session moves `Idle -> Streaming -> Completed` in the good case. A
//! retryable failure moves it to `Retrying`; after the backoff delay the
//! next attempt starts from `Idle` again. Events already delivered are not
//! sent twice: a new attempt continues after them rather than replaying the
//! stream, so the seam may show a gap or a repeated prefix because the
//! backend cannot resume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azproxy_http::{ExponentialBackoff, calculate_backoff};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::ChunkStream;
use crate::config::RelayConfig;
use crate::error::{BackendError, BackendErrorKind, RelayFailed};
use crate::events::{EventSink, ProxyEvent};
use crate::sse::{DONE_EVENT, SseFramer, data_event, is_done_event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Streaming,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

/// Opens upstream attempts for a session.
#[async_trait]
pub trait AttemptSource: Send + Sync {
    /// Dispatch attempt number `attempt` (1-based).
    async fn open(&self, attempt: u32) -> Result<ChunkStream, BackendError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayPolicy {
    /// Attempts in total, the first one included.
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
    /// Longest unterminated SSE event held while framing.
    pub max_event_bytes: usize,
}

impl RelayPolicy {
    #[must_use]
    pub fn from_config(cfg: &RelayConfig) -> Self {
        let mut backoff = ExponentialBackoff::new(cfg.base_delay, cfg.max_delay);
        backoff.jitter = cfg.jitter;
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff,
            max_event_bytes: cfg.max_event_bytes.max(1),
        }
    }

    /// Wait before the attempt that follows failed attempt `attempt`.
    ///
    /// `base * 2^(attempt-1)` capped at the maximum; an upstream
    /// `Retry-After` stretches it, still within the cap.
    #[must_use]
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        let delay = calculate_backoff(&self.backoff, index);
        retry_after
            .map_or(delay, |hint| delay.max(hint))
            .min(self.backoff.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed { attempts: u32, events: u64 },
    Failed(RelayFailed),
    Cancelled { attempts: u32 },
}

enum PumpEnd {
    Done,
    Cancelled,
    Failed(BackendError),
}

const FALLBACK_ERROR_EVENT: &[u8] = b"data: {\"error\":{\"message\":\"stream failed\",\
\"type\":\"upstream_error\",\"code\":\"relay_non_retryable\"}}\n\n";

/// One client's stream.
pub struct RelaySession {
    sink: mpsc::Sender<Bytes>,
    source: Arc<dyn AttemptSource>,
    first: Option<Result<ChunkStream, BackendError>>,
    policy: RelayPolicy,
    attempt_count: u32,
    last_error: Option<BackendError>,
    state: RelayState,
    framer: SseFramer,
    delivered: u64,
    cancel: CancellationToken,
    events: Arc<dyn EventSink>,
}

impl RelaySession {
    #[must_use]
    pub fn new(
        sink: mpsc::Sender<Bytes>,
        source: Arc<dyn AttemptSource>,
        policy: RelayPolicy,
        cancel: CancellationToken,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let framer = SseFramer::with_limit(policy.max_event_bytes);
        Self {
            sink,
            source,
            first: None,
            policy,
            attempt_count: 0,
            last_error: None,
            state: RelayState::Idle,
            framer,
            delivered: 0,
            cancel,
            events,
        }
    }

    /// Use an already dispatched first attempt instead of opening one.
    #[must_use]
    pub fn with_first_attempt(mut self, first: Result<ChunkStream, BackendError>) -> Self {
        self.first = Some(first);
        self
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state
    }

    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&BackendError> {
        self.last_error.as_ref()
    }

    #[must_use]
    pub fn spawn(self) -> JoinHandle<RelayOutcome> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> RelayOutcome {
        loop {
            self.attempt_count += 1;
            let opened = match self.first.take() {
                Some(first) => Some(first),
                None => {
                    let source = Arc::clone(&self.source);
                    let attempt = self.attempt_count;
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => None,
                        () = self.sink.closed() => None,
                        opened = source.open(attempt) => Some(opened),
                    }
                }
            };
            let Some(opened) = opened else {
                return self.cancelled();
            };

            let err = match opened {
                Ok(stream) => match self.pump(stream).await {
                    PumpEnd::Done => return self.complete().await,
                    PumpEnd::Cancelled => return self.cancelled(),
                    PumpEnd::Failed(e) => e,
                },
                Err(e) => e,
            };
            // Half an event from a dead attempt is never forwarded.
            self.framer.reset();

            if !err.is_retryable() {
                return self.fail(RelayFailed::NonRetryable(err)).await;
            }
            let attempts = self.attempt_count;
            if attempts >= self.policy.max_attempts {
                return self
                    .fail(RelayFailed::AttemptsExhausted {
                        attempts,
                        last: err,
                    })
                    .await;
            }

            self.state = RelayState::Retrying;
            let delay = self.policy.delay_after(self.attempt_count, err.retry_after);
            self.events.emit(ProxyEvent::RetryScheduled {
                attempt: self.attempt_count + 1,
                delay,
                kind: err.kind,
            });
            self.last_error = Some(err);

            let waited = tokio::select! {
                biased;
                () = self.cancel.cancelled() => false,
                () = self.sink.closed() => false,
                () = tokio::time::sleep(delay) => true,
            };
            if !waited {
                return self.cancelled();
            }
            self.state = RelayState::Idle;
        }
    }

    async fn pump(&mut self, mut stream: ChunkStream) -> PumpEnd {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return PumpEnd::Cancelled,
                () = self.sink.closed() => return PumpEnd::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if self.state == RelayState::Idle {
                        self.state = RelayState::Streaming;
                    }
                    let events = match self.framer.push(&chunk) {
                        Ok(events) => events,
                        Err(e) => {
                            return PumpEnd::Failed(BackendError::new(
                                BackendErrorKind::InvalidResponse,
                                e.to_string(),
                            ));
                        }
                    };
                    for event in events {
                        if is_done_event(&event) {
                            return PumpEnd::Done;
                        }
                        if !self.forward(event).await {
                            return PumpEnd::Cancelled;
                        }
                    }
                }
                Some(Err(e)) => return PumpEnd::Failed(e),
                None => {
                    if let Some(rest) = self.framer.finish() {
                        if is_done_event(&rest) {
                            return PumpEnd::Done;
                        }
                        if !self.forward(rest).await {
                            return PumpEnd::Cancelled;
                        }
                    }
                    return PumpEnd::Done;
                }
            }
        }
    }

    /// Waits for channel capacity; false once the client is gone.
    async fn forward(&mut self, event: Bytes) -> bool {
        let sent = tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            res = self.sink.send(event) => res.is_ok(),
        };
        if sent {
            self.delivered += 1;
        }
        sent
    }

    async fn complete(mut self) -> RelayOutcome {
        if !self.forward(Bytes::from_static(DONE_EVENT)).await {
            return self.cancelled();
        }
        self.state = RelayState::Completed;
        self.events.emit(ProxyEvent::StreamCompleted {
            attempts: self.attempt_count,
            events: self.delivered,
        });
        RelayOutcome::Completed {
            attempts: self.attempt_count,
            events: self.delivered,
        }
    }

    async fn fail(mut self, failure: RelayFailed) -> RelayOutcome {
        self.state = RelayState::Failed;
        self.events.emit(ProxyEvent::TerminalFailure {
            attempts: self.attempt_count,
            code: failure.code(),
        });
        let event = data_event(&failure.to_body()).unwrap_or_else(|_| {
            Bytes::from_static(FALLBACK_ERROR_EVENT)
        });
        // Best effort: the client may already be gone.
        self.forward(event).await;
        RelayOutcome::Failed(failure)
    }

    fn cancelled(mut self) -> RelayOutcome {
        self.state = RelayState::Cancelled;
        self.events.emit(ProxyEvent::StreamCancelled {
            attempts: self.attempt_count,
        });
        RelayOutcome::Cancelled {
            attempts: self.attempt_count,
        }
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("state", &self.state)
            .field("attempt_count", &self.attempt_count)
            .field("max_attempts", &self.policy.max_attempts)
            .field("delivered", &self.delivered)
            .field("last_error", &self.last_error)
            .finish_non_exhaustive()
    }
}

/// The client side of a running session.
#[derive(Debug)]
pub struct RelayHandle {
    pub rx: mpsc::Receiver<Bytes>,
    pub join: JoinHandle<RelayOutcome>,
}
