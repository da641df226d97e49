use crate::error::HttpError;
use crate::response::ResponseBody;
use bytes::Bytes;
use futures_core::Stream;
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

pin_project! {
    /// Response body as a stream of data chunks.
    ///
    /// Trailers and empty frames are skipped. When an idle timeout is set, the
    /// timer restarts on every chunk and the stream ends with
    /// [`HttpError::IdleTimeout`] once it fires. Any error ends the stream.
    pub struct ChunkStream {
        #[pin]
        body: ResponseBody,
        #[pin]
        idle: Option<Sleep>,
        idle_timeout: Option<Duration>,
        done: bool,
    }
}

impl ChunkStream {
    #[must_use]
    pub fn new(body: ResponseBody, idle_timeout: Option<Duration>) -> Self {
        Self {
            body,
            idle: idle_timeout.map(tokio::time::sleep),
            idle_timeout,
            done: false,
        }
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("idle_timeout", &self.idle_timeout)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, HttpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        loop {
            match this.body.as_mut().poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) if !data.is_empty() => {
                        if let (Some(sleep), Some(limit)) =
                            (this.idle.as_mut().as_pin_mut(), *this.idle_timeout)
                        {
                            sleep.reset(Instant::now() + limit);
                        }
                        return Poll::Ready(Some(Ok(data)));
                    }
                    _ => {}
                },
                Poll::Ready(Some(Err(e))) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(HttpError::Transport(e))));
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if let Some(sleep) = this.idle.as_mut().as_pin_mut()
                        && sleep.poll(cx).is_ready()
                    {
                        *this.done = true;
                        let limit = this.idle_timeout.unwrap_or_default();
                        return Poll::Ready(Some(Err(HttpError::IdleTimeout(limit))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use http_body::Frame;
    use http_body_util::{BodyExt, StreamBody};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    type FrameResult = Result<Frame<Bytes>, Box<dyn std::error::Error + Send + Sync>>;

    fn channel_body() -> (mpsc::Sender<FrameResult>, ResponseBody) {
        let (tx, rx) = mpsc::channel::<FrameResult>(8);
        let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(rx)));
        (tx, body)
    }

    #[tokio::test(start_paused = true)]
    async fn yields_chunks_then_ends() {
        let (tx, body) = channel_body();
        tx.send(Ok(Frame::data(Bytes::from_static(b"a")))).await.unwrap();
        tx.send(Ok(Frame::data(Bytes::new()))).await.unwrap();
        tx.send(Ok(Frame::data(Bytes::from_static(b"b")))).await.unwrap();
        drop(tx);

        let chunks: Vec<_> = ChunkStream::new(body, Some(Duration::from_secs(30)))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_hits_idle_timeout() {
        let (tx, body) = channel_body();
        tx.send(Ok(Frame::data(Bytes::from_static(b"first")))).await.unwrap();

        let mut stream = Box::pin(ChunkStream::new(body, Some(Duration::from_secs(5))));
        assert_eq!(stream.next().await.unwrap().unwrap(), "first");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, HttpError::IdleTimeout(d) if d == Duration::from_secs(5)));
        assert!(stream.next().await.is_none());
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_but_steady_peer_is_not_cut_off() {
        let (tx, body) = channel_body();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(4)).await;
                tx.send(Ok(Frame::data(Bytes::from_static(b"x")))).await.unwrap();
            }
        });

        let chunks: Vec<_> = ChunkStream::new(body, Some(Duration::from_secs(5)))
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn body_error_is_transport() {
        let (tx, body) = channel_body();
        tx.send(Err("reset".into())).await.unwrap();
        let mut stream = Box::pin(ChunkStream::new(body, None));
        assert!(matches!(
            stream.next().await.unwrap(),
            Err(HttpError::Transport(_))
        ));
        assert!(stream.next().await.is_none());
    }
}
