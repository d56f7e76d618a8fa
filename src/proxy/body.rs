//! Streaming response body relayed from a downstream instance.
//!
//! Frames are passed through as they arrive. The body enforces what is left of the
//! request's overall deadline and owns the drop guard of the downstream connection,
//! so dropping the body (client gone) cancels the connection task.

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::DropGuard;
use tracing::warn;

use crate::core::error::GatewayError;

/// Response body bounded by the request deadline
///
/// Any failure after headers were sent surfaces as `PartialResponseFailure`; the
/// server then tears the client connection down instead of sending anything else.
pub struct DeadlineBody<B> {
    inner: B,
    deadline: Pin<Box<Sleep>>,
    overall_timeout: Duration,
    instance: String,
    finished: bool,
    _connection: Option<DropGuard>,
}

impl<B> DeadlineBody<B> {
    pub fn new(
        inner: B,
        deadline: Instant,
        overall_timeout: Duration,
        instance: String,
        connection: Option<DropGuard>,
    ) -> Self {
        Self {
            inner,
            deadline: Box::pin(sleep_until(deadline)),
            overall_timeout,
            instance,
            finished: false,
            _connection: connection,
        }
    }

    fn fail(&mut self, reason: String) -> GatewayError {
        self.finished = true;
        warn!(instance = %self.instance, reason = %reason, "Downstream response failed mid-stream");
        GatewayError::PartialResponseFailure {
            instance: self.instance.clone(),
            reason,
        }
    }
}

impl<B> Body for DeadlineBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    type Data = Bytes;
    type Error = GatewayError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => return Poll::Ready(Some(Ok(frame))),
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(this.fail(e.to_string())))),
            Poll::Ready(None) => {
                this.finished = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            let reason = format!("response exceeded overall timeout of {:?}", this.overall_timeout);
            return Poll::Ready(Some(Err(this.fail(reason))));
        }

        Poll::Pending
    }

    fn is_end_stream(&self) -> bool {
        self.finished || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full, StreamBody};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_complete_body_passes_through() {
        let inner = Full::new(Bytes::from_static(b"hello"));
        let body = DeadlineBody::new(
            inner,
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(5),
            "host1:8081".to_string(),
            None,
        );
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_stalled_body_hits_deadline() {
        let (_tx, rx) = futures::channel::mpsc::unbounded::<Result<Frame<Bytes>, std::io::Error>>();
        let inner = StreamBody::new(rx);
        let mut body = DeadlineBody::new(
            inner,
            Instant::now() + Duration::from_millis(50),
            Duration::from_millis(50),
            "host1:8081".to_string(),
            None,
        );

        let err = body.frame().await.unwrap().unwrap_err();
        assert!(matches!(err, GatewayError::PartialResponseFailure { .. }));
        assert!(body.is_end_stream());
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn test_inner_error_becomes_partial_failure() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Frame<Bytes>, std::io::Error>>();
        tx.unbounded_send(Ok(Frame::data(Bytes::from_static(b"partial")))).unwrap();
        tx.unbounded_send(Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();
        let mut body = DeadlineBody::new(
            StreamBody::new(rx),
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(5),
            "host1:8081".to_string(),
            None,
        );

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), Bytes::from_static(b"partial"));
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("reset"));
    }

    #[tokio::test]
    async fn test_dropping_body_cancels_connection() {
        let token = CancellationToken::new();
        let body = DeadlineBody::new(
            Full::new(Bytes::new()),
            Instant::now() + Duration::from_secs(5),
            Duration::from_secs(5),
            "host1:8081".to_string(),
            Some(token.clone().drop_guard()),
        );
        assert!(!token.is_cancelled());
        drop(body);
        assert!(token.is_cancelled());
    }
}
