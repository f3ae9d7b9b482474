use futures::{FutureExt, Stream};
use std::{pin::Pin, task::Poll, time::Duration};
use tokio::time::sleep;

/// A stream that yields exponentially increasing backoff durations.
///
/// Each item becomes ready after sleeping for the duration it carries. The first sleep lasts
/// the initial duration, every following one twice the previous, capped at `max_backoff`.
pub struct ExponentialBackoff {
    /// Current number of retries.
    retry_count: usize,
    /// Maximum number of retries before closing the stream. `None` retries forever.
    max_retries: Option<usize>,
    /// The current backoff duration.
    backoff: Duration,
    /// Upper bound of a single backoff.
    max_backoff: Duration,
    /// The current backoff timeout, if any.
    /// We need the timeout to be pinned (`Sleep` is not `Unpin`)
    timeout: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_retries: Option<usize>) -> Self {
        Self {
            retry_count: 0,
            max_retries,
            backoff: initial,
            max_backoff: Duration::MAX,
            timeout: None,
        }
    }

    /// Caps a single backoff at `max`.
    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self.backoff = self.backoff.min(max);
        self
    }

    /// Number of backoffs yielded so far.
    pub fn retry_count(&self) -> usize {
        self.retry_count
    }
}

impl Stream for ExponentialBackoff {
    type Item = Duration;

    /// Polls the exponential backoff stream. Returns `Poll::Ready` with the elapsed backoff
    /// duration once its timeout fired, or `None` once the retries are exhausted.
    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.max_retries.map_or(false, |max| this.retry_count >= max) {
            return Poll::Ready(None);
        }

        let backoff = this.backoff;
        let timeout = this.timeout.get_or_insert_with(|| Box::pin(sleep(backoff)));
        if timeout.poll_unpin(cx).is_pending() {
            return Poll::Pending;
        }

        // Timeout has elapsed, so clear it and double the backoff
        this.timeout = None;
        this.retry_count += 1;
        this.backoff = this.backoff.saturating_mul(2).min(this.max_backoff);

        Poll::Ready(Some(backoff))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test]
    async fn doubles_until_exhausted() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Some(3));

        let start = Instant::now();
        let items: Vec<_> = (&mut backoff).collect().await;

        assert_eq!(
            items,
            vec![Duration::from_millis(5), Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert!(start.elapsed() >= Duration::from_millis(35));
        assert_eq!(backoff.retry_count(), 3);
        assert!(backoff.next().await.is_none());
    }

    #[tokio::test]
    async fn caps_backoff() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(2), None).max_backoff(Duration::from_millis(4));

        let items: Vec<_> = (&mut backoff).take(4).collect().await;
        assert_eq!(
            items,
            vec![
                Duration::from_millis(2),
                Duration::from_millis(4),
                Duration::from_millis(4),
                Duration::from_millis(4)
            ]
        );
    }
}
