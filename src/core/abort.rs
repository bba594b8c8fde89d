//! Cancellable abort signal shared between callers and pools.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

type Listener = Box<dyn FnOnce() + Send>;

/// Handle returned by [`AbortToken::on_abort`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Inner {
    aborted: AtomicBool,
    listeners: Mutex<Listeners>,
    notify: Notify,
}

/// A cancellable signal: an `aborted` flag plus a broadcast to listeners.
///
/// Clones share the same signal. Aborting is idempotent and fires every
/// registered listener exactly once, on the thread that called [`abort`].
///
/// [`abort`]: AbortToken::abort
#[derive(Clone, Default)]
pub struct AbortToken {
    inner: Arc<Inner>,
}

impl AbortToken {
    /// Create a fresh, un-aborted token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal.
    pub fn abort(&self) {
        let fired = {
            let mut listeners = self.inner.listeners.lock();
            if self.inner.aborted.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut listeners.entries)
        };
        self.inner.notify.notify_waiters();
        for (_, listener) in fired {
            listener();
        }
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// Register a listener called once when the token is aborted.
    ///
    /// Returns `None` without calling `listener` if the token has already
    /// fired, so callers can handle that case under their own locks.
    pub fn on_abort<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = self.inner.listeners.lock();
        if self.is_aborted() {
            return None;
        }
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Box::new(listener)));
        Some(ListenerId(id))
    }

    /// Detach a listener. Unknown or already fired ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.inner.listeners.lock().entries.retain(|(entry, _)| *entry != id.0);
    }

    /// Resolves once the token is aborted.
    pub async fn aborted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_aborted() {
            return;
        }
        notified.await;
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.inner.listeners.lock().entries.len()
    }
}

impl fmt::Debug for AbortToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortToken")
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}
