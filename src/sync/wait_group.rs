use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A counter of outstanding units of work that can be awaited until it drops back to zero.
///
/// Every [`WaitGroup::add`] must be paired with a [`WaitGroup::done`] once the unit of work
/// completes. [`WaitGroup::wait`] suspends the caller until the counter is zero.
///
/// `WaitGroup` is a cheap handle: clones share the same counter.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    count: AtomicUsize,
    zero: Notify,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WaitGroupError {
    /// `done` was called more times than `add` accounted for.
    #[error("`done` was called on a wait group whose counter is already zero")]
    NegativeCounter,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` new units of work.
    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark one unit of work as completed.
    ///
    /// Waiters are released when the counter reaches zero.
    pub fn done(&self) -> Result<(), WaitGroupError> {
        let previous = self
            .inner
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| WaitGroupError::NegativeCounter)?;
        if previous == 1 {
            self.inner.zero.notify_waiters();
        }
        Ok(())
    }

    /// The number of outstanding units of work.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until the counter is zero. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            // Register interest before checking the counter, otherwise a `done` landing between
            // the check and the `.await` would be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.count())
            .finish()
    }
}
