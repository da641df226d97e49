use crate::error::HttpError;
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer that fills in headers the caller did not set.
///
/// Used for `User-Agent`, and for any fixed header a deployment wants on
/// every outbound call. Headers already present on the request win.
#[derive(Clone, Default)]
pub struct DefaultHeadersLayer {
    defaults: Arc<HeaderMap>,
}

impl DefaultHeadersLayer {
    /// Layer that only sets `User-Agent`.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` if the string is not a valid header value.
    pub fn user_agent(user_agent: impl AsRef<str>) -> Result<Self, HttpError> {
        let mut map = HeaderMap::new();
        map.insert(
            http::header::USER_AGENT,
            HeaderValue::from_str(user_agent.as_ref())?,
        );
        Ok(Self {
            defaults: Arc::new(map),
        })
    }

    #[must_use]
    pub fn with(mut self, name: HeaderName, value: HeaderValue) -> Self {
        Arc::make_mut(&mut self.defaults).insert(name, value);
        self
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeadersService {
            inner,
            defaults: Arc::clone(&self.defaults),
        }
    }
}

#[derive(Clone)]
pub struct DefaultHeadersService<S> {
    inner: S,
    defaults: Arc<HeaderMap>,
}

impl<S, B> Service<Request<B>> for DefaultHeadersService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        let headers = req.headers_mut();
        for (name, value) in self.defaults.iter() {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
        self.inner.call(req)
    }
}
