use crate::error::HttpError;
use crate::stream::ChunkStream;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime};

/// Preview length kept in `HttpStatus` errors.
const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Boxed response body as produced by the client stack.
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Parse a `Retry-After` header given as seconds or as an HTTP-date.
///
/// Returns `None` when the header is absent, malformed, or in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    httpdate::parse_http_date(value)
        .ok()?
        .duration_since(SystemTime::now())
        .ok()
}

/// Response returned by [`RequestBuilder::send`](crate::RequestBuilder::send).
///
/// `send` succeeds for every status; use [`error_for_status`](Self::error_for_status)
/// or the checked readers to turn non-2xx into errors. The body can be read
/// once, either buffered (`bytes`, `json`, `text`) or streamed
/// ([`into_chunk_stream`](Self::into_chunk_stream)).
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
    pub(crate) idle_read_timeout: Option<Duration>,
}

impl HttpResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// # Errors
    /// Returns `HttpError::HttpStatus` (without a body preview) for non-2xx.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.inner.status().is_success() {
            return Ok(self);
        }
        Err(HttpError::HttpStatus {
            status: self.inner.status(),
            body_preview: String::new(),
            retry_after: parse_retry_after(self.inner.headers()),
        })
    }

    /// Read the body without looking at the status.
    ///
    /// # Errors
    /// `BodyTooLarge` past `max_body_size`, `Transport` if the body breaks.
    pub async fn bytes(self) -> Result<Bytes, HttpError> {
        read_limited(self.inner.into_body(), self.max_body_size).await
    }

    /// # Errors
    /// `HttpStatus` (with a short body preview) for non-2xx, then as [`bytes`](Self::bytes).
    pub async fn checked_bytes(self) -> Result<Bytes, HttpError> {
        let status = self.inner.status();
        if status.is_success() {
            return self.bytes().await;
        }
        let retry_after = parse_retry_after(self.inner.headers());
        let limit = self.max_body_size.min(ERROR_BODY_PREVIEW_LIMIT);
        let body_preview = match read_limited(self.inner.into_body(), limit).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(HttpError::BodyTooLarge { .. }) => "<body too large for preview>".to_owned(),
            Err(e) => return Err(e),
        };
        Err(HttpError::HttpStatus {
            status,
            body_preview,
            retry_after,
        })
    }

    /// # Errors
    /// As [`checked_bytes`](Self::checked_bytes), plus `Json` on parse failure.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, HttpError> {
        let bytes = self.checked_bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// # Errors
    /// As [`checked_bytes`](Self::checked_bytes).
    pub async fn text(self) -> Result<String, HttpError> {
        let bytes = self.checked_bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Stream the body chunk by chunk, failing with `IdleTimeout` if the peer
    /// goes quiet for longer than the client's idle-read timeout.
    ///
    /// No size limit applies; the consumer decides how much to keep.
    #[must_use]
    pub fn into_chunk_stream(self) -> ChunkStream {
        ChunkStream::new(self.inner.into_body(), self.idle_read_timeout)
    }
}

async fn read_limited(mut body: ResponseBody, limit: usize) -> Result<Bytes, HttpError> {
    let mut collected = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Ok(data) = frame.into_data() {
            let actual = collected.len() + data.len();
            if actual > limit {
                return Err(HttpError::BodyTooLarge { limit, actual });
            }
            collected.extend_from_slice(&data);
        }
    }
    Ok(collected.freeze())
}
