//! Wait scopes.
//!
//! A [WaitScope] bounds a single wait. It can be cancelled by whoever holds a
//! clone of it, and it may carry a deadline. Ending a scope only releases the
//! waits made under it; the thing being waited on is untouched.
//!
//! Deadlines fire on their own. The first time something waits on a scope
//! with a deadline, the scope is handed to a shared background thread that
//! ends it when the deadline passes, whatever executor (if any) the waiter is
//! running on.
//!
//! ```
//! use completeable::futures::completeable::{Completeable, Error};
//! use completeable::scope::{Abandoned, WaitScope};
//! use std::time::Duration;
//!
//! let fut = Completeable::<u32>::new();
//! let scope = WaitScope::with_timeout(Duration::from_millis(10));
//!
//! assert_eq!(
//!     fut.wait(&scope),
//!     Err(Error::Abandoned(Abandoned::DeadlineExceeded))
//! );
//! assert!(!fut.is_cancelled());
//! ```
use std::{
    collections::BTreeMap,
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
    },
    thread,
    time::{Duration, Instant},
};

use log::{trace, warn};
use thiserror::Error;

use crate::futures::event::Event;

/// Why a wait scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Abandoned {
    #[error("wait scope cancelled")]
    Cancelled,
    #[error("wait scope deadline exceeded")]
    DeadlineExceeded,
}

/// A cancellable, optionally time-bounded scope for waiting.
///
/// Clones share the same underlying scope: cancelling one cancels them all.
#[derive(Debug, Clone, Default)]
pub struct WaitScope {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    deadline: Option<Instant>,
    reason: Mutex<Option<Abandoned>>,
    done: Event,
    watched: AtomicBool,
}

impl WaitScope {
    /// A scope that ends only when cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that ends `timeout` from now, or earlier if cancelled.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                ..Default::default()
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// End the scope, releasing every wait made under it. Has no effect if the
    /// scope has already ended.
    pub fn cancel(&self) {
        self.abandon(Abandoned::Cancelled);
    }

    /// Why the scope ended, or `None` if it is still live. A deadline that has
    /// passed is recorded here the first time it is observed.
    pub fn reason(&self) -> Option<Abandoned> {
        if let Some(reason) = *self.lock() {
            return Some(reason);
        }

        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.abandon(Abandoned::DeadlineExceeded);
                *self.lock()
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// Notified once a reason has been recorded.
    pub(crate) fn done(&self) -> &Event {
        &self.inner.done
    }

    /// Make sure the deadline, if any, ends the scope when it passes even if
    /// nobody looks. Only the first call has an effect.
    pub(crate) fn watch_deadline(&self) {
        let Some(deadline) = self.inner.deadline else {
            return;
        };

        if !self.inner.watched.swap(true, Ordering::AcqRel) {
            DEADLINES.watch(deadline, Arc::downgrade(&self.inner));
        }
    }

    fn abandon(&self, reason: Abandoned) {
        {
            let mut current = self.lock();

            if current.is_some() {
                return;
            }

            *current = Some(reason);
        }

        self.inner.done.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Option<Abandoned>> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

static DEADLINES: Deadlines = Deadlines {
    queue: Mutex::new(BTreeMap::new()),
    changed: Condvar::new(),
    started: AtomicBool::new(false),
    next_id: AtomicU64::new(0),
};

/// Scopes waiting for their deadline, ordered by deadline with a sequence
/// number to keep keys unique. Scopes are held weakly so that dropping the
/// last clone of a scope is not delayed until its deadline.
struct Deadlines {
    queue: Mutex<BTreeMap<(Instant, u64), Weak<Inner>>>,
    changed: Condvar,
    started: AtomicBool,
    next_id: AtomicU64,
}

impl Deadlines {
    fn watch(&'static self, deadline: Instant, scope: Weak<Inner>) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let spawned = thread::Builder::new()
                .name("wait-scope-deadlines".into())
                .spawn(move || self.run());

            if let Err(e) = spawned {
                // Waiters still observe the deadline whenever they are polled.
                warn!("could not start the deadline thread: {}", e);
                self.started.store(false, Ordering::Release);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert((deadline, id), scope);
        self.changed.notify_one();
    }

    fn run(&self) {
        let mut queue = self.lock();

        loop {
            let now = Instant::now();
            let pending = queue.split_off(&(now, u64::MAX));
            let due = mem::replace(&mut *queue, pending);

            if !due.is_empty() {
                drop(queue);

                trace!("{} wait scope deadline(s) due", due.len());

                for inner in due.into_values().filter_map(|scope| scope.upgrade()) {
                    WaitScope { inner }.reason();
                }

                queue = self.lock();
                continue;
            }

            queue = match queue.keys().next() {
                Some(&(deadline, _)) => {
                    self.changed
                        .wait_timeout(queue, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .changed
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(Instant, u64), Weak<Inner>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
