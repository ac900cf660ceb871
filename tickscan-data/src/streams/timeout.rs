//! Idle-read guard for feed streams.
//!
//! A silently dropped feed connection often produces no error at all, it just stops sending.
//! [`TimeoutStream`] ends the stream once nothing has arrived for the configured period so the
//! caller's reconnect loop takes over.

use futures::Stream;
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;

/// Default idle period after which a feed stream is considered dead.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper that terminates the inner stream after `timeout_duration` without an item.
#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout_duration: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
    timed_out: bool,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout_duration: Duration) -> Self {
        Self {
            inner,
            timeout_duration,
            deadline: Box::pin(tokio::time::sleep(timeout_duration)),
            timed_out: false,
        }
    }

    pub fn with_default_timeout(inner: S) -> Self {
        Self::new(inner, DEFAULT_READ_TIMEOUT)
    }

    /// Determine if the stream ended because it went idle rather than because the inner
    /// stream finished.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        let timeout_duration = self.timeout_duration;
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline
                    .as_mut()
                    .reset(Instant::now() + timeout_duration);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_secs = timeout_duration.as_secs(),
                        "feed read timeout, no data received"
                    );
                    self.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        let mut stream =
            TimeoutStream::new(UnboundedReceiverStream::new(rx), Duration::from_secs(5));

        tx.send(1).unwrap();
        assert_eq!(stream.next().await, Some(1));

        // Activity resets the deadline
        tokio::time::sleep(Duration::from_secs(4)).await;
        tx.send(2).unwrap();
        assert_eq!(stream.next().await, Some(2));

        let started = Instant::now();
        assert_eq!(stream.next().await, None);
        assert!(stream.timed_out());
        assert!(started.elapsed() >= Duration::from_secs(5));

        // Stays terminated even if more data arrives
        tx.send(3).unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_stream_is_not_a_timeout() {
        let stream = TimeoutStream::with_default_timeout(futures::stream::iter([1, 2, 3]));
        assert_eq!(stream.collect::<Vec<_>>().await, vec![1, 2, 3]);
    }
}
