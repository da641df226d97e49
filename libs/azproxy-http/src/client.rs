use crate::builder::HttpClientBuilder;
use crate::config::TransportSecurity;
use crate::error::HttpError;
use crate::request::RequestBuilder;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tower::Service;
use tower::buffer::Buffer;

pub(crate) type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

pub(crate) type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Outbound HTTP client.
///
/// `Clone + Send + Sync`; clones share the connection pool and the buffer
/// worker, so store it directly in state without a mutex.
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) service: BufferedService,
    pub(crate) max_body_size: usize,
    pub(crate) transport_security: TransportSecurity,
    pub(crate) idle_read_timeout: Option<Duration>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("max_body_size", &self.max_body_size)
            .field("transport_security", &self.transport_security)
            .field("idle_read_timeout", &self.idle_read_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(http::Method::POST, url)
    }

    pub fn request(&self, method: http::Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(
            self.service.clone(),
            self.max_body_size,
            self.idle_read_timeout,
            method,
            url.to_owned(),
            self.transport_security,
        )
    }
}

/// Unwrap an `HttpError` boxed by the buffer, or report the worker as gone.
pub(crate) fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(error = %err, "buffer worker closed unexpectedly; service unavailable");
            HttpError::ServiceClosed
        }
    }
}

/// Poll the buffer once; a full buffer is `Overloaded` rather than a wait.
pub(crate) async fn try_acquire_buffer_slot(
    service: &mut BufferedService,
) -> Result<(), HttpError> {
    use std::task::Poll;

    let polled = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match polled {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(HttpError::Overloaded),
    }
}
