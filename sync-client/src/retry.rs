//! Retry with exponential backoff around a snapshot provider.
//!
//! Only the fetch is retried, never the whole refresh. After the last
//! attempt the provider's own error comes back unchanged, so the engine
//! reports a `getSnapshot` failure exactly once.

use async_trait::async_trait;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use sync_core::RetryPolicy;
use sync_types::{SnapshotEnvelope, Topic};

use crate::report::{emit, ErrorCallback, SyncErrorContext, SyncPhase};
use crate::{SnapshotProvider, SyncError, TransportError};

/// One failed attempt that will be retried.
#[derive(Debug, Clone)]
pub struct RetryAttempt<'a> {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    /// Why it failed.
    pub error: &'a TransportError,
    /// Sleep before the next attempt.
    pub next_delay: Duration,
}

/// Hook called before each backoff sleep.
pub type RetryCallback = Arc<dyn Fn(&RetryAttempt<'_>) + Send + Sync>;

/// A provider wrapped with a [`RetryPolicy`].
pub struct RetryingProvider<P, T> {
    inner: P,
    policy: RetryPolicy,
    on_retry: Option<RetryCallback>,
    _data: PhantomData<fn() -> T>,
}

/// Wrap `provider` so failed fetches are retried under `policy`.
pub fn with_retry<P, T>(provider: P, policy: RetryPolicy) -> RetryingProvider<P, T>
where
    P: SnapshotProvider<T>,
    T: Send + 'static,
{
    RetryingProvider {
        inner: provider,
        policy,
        on_retry: None,
        _data: PhantomData,
    }
}

/// Like [`with_retry`], and report every intermediate failure.
///
/// Each retry is logged at warn level and passed to `on_error` with phase
/// `getSnapshot`, `will_retry = true`, the attempt number and the delay.
/// The final failure is not reported here.
pub fn with_retry_reporting<P, T>(
    provider: P,
    topic: Topic,
    policy: RetryPolicy,
    on_error: Option<ErrorCallback>,
) -> RetryingProvider<P, T>
where
    P: SnapshotProvider<T>,
    T: Send + 'static,
{
    with_retry(provider, policy).on_retry(move |retry: &RetryAttempt<'_>| {
        let error = SyncError::Snapshot(retry.error.clone());
        let ctx = SyncErrorContext::new(SyncPhase::GetSnapshot, &error)
            .with_topic(&topic)
            .with_retry(retry.attempt, retry.next_delay);
        emit(on_error.as_ref(), &ctx);
    })
}

impl<P, T> RetryingProvider<P, T> {
    /// Install a hook called before each backoff sleep.
    pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt<'_>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: fmt::Debug, T> fmt::Debug for RetryingProvider<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingProvider")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl<P, T> SnapshotProvider<T> for RetryingProvider<P, T>
where
    P: SnapshotProvider<T>,
    T: Send + 'static,
{
    async fn get_snapshot(&self) -> Result<SnapshotEnvelope<T>, TransportError> {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            match self.inner.get_snapshot().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) if attempt + 1 >= attempts => return Err(err),
                Err(err) => {
                    let next_delay = self.policy.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt = attempt + 1,
                        next_delay_ms = next_delay.as_millis() as u64,
                        error = %err,
                        "snapshot fetch failed, retrying"
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(&RetryAttempt {
                            attempt: attempt + 1,
                            error: &err,
                            next_delay,
                        });
                    }
                    tokio::time::sleep(next_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
