//! Advisory resource locks and the bounded retry used to acquire them.

use std::fmt;
use std::time::Duration;

use eyre::eyre;

use crate::error::{StorageError, StorageErrorKind};

/// Anything a driver keeps alive to hold a lock: a locked file descriptor,
/// an owned mutex guard. Dropping the token releases the lock.
pub trait LockToken: Send + Sync + 'static {}

impl<T> LockToken for T where T: Send + Sync + 'static {}

/// A live advisory lock on a single resource.
///
/// The lock is released by [`ResourceLock::unlock`], or when the value is
/// dropped, so an early return or `?` in the owning operation still releases it.
pub struct ResourceLock {
    resource: String,
    token: Option<Box<dyn LockToken>>,
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("resource", &self.resource)
            .field("held", &self.token.is_some())
            .finish()
    }
}

impl ResourceLock {
    /// Wrap a driver-specific token which holds the lock while alive.
    pub fn new<T: LockToken>(resource: impl Into<String>, token: T) -> Self {
        Self {
            resource: resource.into(),
            token: Some(Box::new(token)),
        }
    }

    /// The name of the locked resource.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock.
    pub fn unlock(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(token) = self.token.take() {
            drop(token);
            tracing::trace!(resource = %self.resource, "released lock");
        }
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Exponential backoff for non-blocking lock attempts.
///
/// The default makes one initial attempt and then retries 4 times, waiting
/// 25ms, 50ms, 100ms and 200ms before each retry, 375ms in all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetry {
    /// The delay before the first retry.
    pub delay: Duration,

    /// The factor applied to the delay after each retry.
    pub exponent: u32,

    /// The number of retries after the initial attempt.
    pub retries: u32,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(25),
            exponent: 2,
            retries: 4,
        }
    }
}

impl LockRetry {
    /// Create a new retry policy.
    pub fn new(delay: Duration, exponent: u32, retries: u32) -> Self {
        Self {
            delay,
            exponent,
            retries,
        }
    }

    /// The total time spent waiting if every attempt fails.
    pub fn budget(&self) -> Duration {
        let mut delay = self.delay;
        let mut total = Duration::ZERO;
        for _ in 0..self.retries {
            total = total.saturating_add(delay);
            delay = delay.saturating_mul(self.exponent);
        }
        total
    }

    /// Run `attempt` until it yields a lock or the retries are exhausted.
    ///
    /// `attempt` returns `Ok(None)` when the resource is held elsewhere; it must
    /// not block. Errors from `attempt` end the loop immediately. Exhaustion is
    /// reported as [`StorageErrorKind::LockTimeout`].
    pub async fn acquire<T, F>(
        &self,
        engine: &'static str,
        resource: &str,
        mut attempt: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Result<Option<T>, StorageError>,
    {
        let mut delay = self.delay;
        for retry in 0..=self.retries {
            if let Some(held) = attempt()? {
                return Ok(held);
            }

            if retry == self.retries {
                break;
            }

            tracing::trace!(%resource, ?delay, retry, "lock busy, backing off");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(self.exponent);
        }

        tracing::warn!(%resource, retries = self.retries, "lock timeout");
        Err(StorageError::builder(
            engine,
            StorageErrorKind::LockTimeout,
            eyre!("lock still held after {} retries", self.retries),
        )
        .path(resource)
        .build())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn default_budget() {
        assert_eq!(LockRetry::default().budget(), Duration::from_millis(375));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retries() {
        let attempts = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = LockRetry::default()
            .acquire("test", "busy", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<Option<()>, StorageError>(None)
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::LockTimeout);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(375));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_released() {
        let attempts = AtomicU32::new(0);

        let value = LockRetry::default()
            .acquire("test", "contended", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StorageError>((n == 2).then_some(n))
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
    }

    #[test]
    fn drop_releases_token() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let lock = ResourceLock::new("pkg", Flag(released.clone()));
        assert_eq!(lock.resource(), "pkg");
        assert!(!released.load(Ordering::SeqCst));

        lock.unlock();
        assert!(released.load(Ordering::SeqCst));
    }
}
