//! One-shot broadcast events.
//!
//! An [Event] starts out un-notified and can be notified exactly once. After
//! that it stays notified forever: every waiter, whether it started waiting
//! before the notification or arrives long after it, observes it. Nothing is
//! consumed by waiting, so any number of tasks and threads can wait on the
//! same event.
//!
//! # Example
//!
//! ```
//! use completeable::futures::event::Event;
//! use completeable::task::Executor;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let evt = Arc::new(Event::new());
//!
//! let notifier = {
//!     let evt = evt.clone();
//!     thread::spawn(move || evt.notify_all())
//! };
//!
//! {
//!     let evt = evt.clone();
//!     Executor::block_on(async move { evt.wait().await });
//! }
//! assert!(notifier.join().unwrap());
//! assert!(evt.is_notified());
//! ```
use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use slab::Slab;

/// A one-shot, broadcast event.
///
/// See the [module-level documentation](self) for more information.
#[derive(Default)]
pub struct Event {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    notified: bool,
    waiters: Slab<Waker>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify the event, waking every task currently waiting on it. Returns
    /// `true` if this call was the one that notified the event and `false` if
    /// it had already been notified.
    pub fn notify_all(&self) -> bool {
        let waiters = {
            let mut inner = self.lock();

            if inner.notified {
                return false;
            }

            inner.notified = true;
            mem::take(&mut inner.waiters)
        };

        for (_, waker) in waiters {
            waker.wake();
        }

        true
    }

    pub fn is_notified(&self) -> bool {
        self.lock().notified
    }

    /// Returns a future that resolves once the event has been notified. If it
    /// already has been, the future resolves on first poll.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            evt: self,
            key: None,
        }
    }

    /// Register `waker` to be woken on notification, reusing the slot named by
    /// `key` if the caller already holds one. Returns `true`, without
    /// registering anything, if the event has already been notified.
    pub(crate) fn register(&self, key: &mut Option<usize>, waker: &Waker) -> bool {
        let mut inner = self.lock();

        if inner.notified {
            return true;
        }

        match key.and_then(|k| inner.waiters.get_mut(k)) {
            Some(existing) => {
                if !existing.will_wake(waker) {
                    *existing = waker.clone();
                }
            }
            None => *key = Some(inner.waiters.insert(waker.clone())),
        }

        false
    }

    pub(crate) fn deregister(&self, key: &mut Option<usize>) {
        if let Some(k) = key.take() {
            let mut inner = self.lock();

            // Once notified the slab has been handed off, so `k` may name
            // someone else's slot.
            if !inner.notified {
                inner.waiters.try_remove(k);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("notified", &self.is_notified())
            .finish()
    }
}

/// Future returned by [Event::wait].
pub struct EventWait<'a> {
    evt: &'a Event,
    key: Option<usize>,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if this.evt.register(&mut this.key, cx.waker()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for EventWait<'_> {
    fn drop(&mut self) {
        self.evt.deregister(&mut self.key);
    }
}
