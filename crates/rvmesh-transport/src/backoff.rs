//! Bounded exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Result, TransportError};

/// Doubling delay, capped at `max`.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.min(max);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The delay to wait now; the following delay doubles up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Poll `check` until it reports ready, sleeping per `backoff` between
/// polls. Returns `Cancelled` if `cancel` fires first.
pub async fn wait_until_ready<F, Fut>(
    mut check: F,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if check().await {
            backoff.reset();
            return Ok(());
        }
        let delay = backoff.next_delay();
        debug!(delay_secs = delay.as_secs(), "not ready, backing off");
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_doubles_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let delays: Vec<u64> = (0..5).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 60, 60]);
        b.reset();
        assert_eq!(b.next_delay().as_secs(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        wait_until_ready(
            move || {
                let c = c.clone();
                async move { c.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
            &mut b,
            &cancel,
        )
        .await
        .expect("eventually ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_ready_cancelled() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            child.cancel();
        });
        let res = wait_until_ready(|| async { false }, &mut b, &cancel).await;
        assert!(matches!(res, Err(TransportError::Cancelled)));
    }
}
