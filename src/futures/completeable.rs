//! Write-once, cancellable futures.
//!
//! A [Completeable] is a container for a value that may not exist yet. A
//! producer fills it in once with [Completeable::complete]; any number of
//! consumers wait for it with [Completeable::get] from async tasks or
//! [Completeable::wait] from plain threads. Anyone may give up on the value
//! altogether with [Completeable::cancel].
//!
//! A future ends up in exactly one terminal state, whichever happens first:
//!
//! - **completed**: every waiter, past and future, receives a clone of the
//!   value. Cancelling afterwards changes nothing.
//! - **cancelled**: every waiter receives [Error::Cancelled], and so does any
//!   later attempt to complete it.
//!
//! Each wait is bounded by its own [WaitScope]. When that scope is cancelled
//! or its deadline passes, that one wait returns [Error::Abandoned] carrying
//! the scope's reason; the future and other waiters are unaffected.
//!
//! # Example
//!
//! ```
//! use completeable::futures::completeable::Completeable;
//! use completeable::scope::WaitScope;
//! use completeable::task::Executor;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let fut = Arc::new(Completeable::<String>::new());
//!
//! let producer = {
//!     let fut = fut.clone();
//!     thread::spawn(move || fut.complete(String::from("hello")))
//! };
//!
//! let got = Executor::block_on(async move { fut.get(&WaitScope::new()).await });
//!
//! assert_eq!(got.unwrap(), "hello");
//! producer.join().unwrap().unwrap();
//! ```
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use log::debug;
use thiserror::Error;

use super::event::Event;
use crate::{
    scope::{Abandoned, WaitScope},
    task::park_on,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("future already complete")]
    AlreadyCompleted,
    #[error("future canceled")]
    Cancelled,
    /// The caller's own wait scope ended before the future did.
    #[error(transparent)]
    Abandoned(#[from] Abandoned),
}

/// Consumer-side view of a value that might not exist yet.
pub trait Deferred<V> {
    /// Wait, from an async task, for the value or for `scope` to end.
    fn get<'a>(&'a self, scope: &'a WaitScope) -> impl Future<Output = Result<V, Error>> + 'a;

    /// Block the calling thread until the value arrives or `scope` ends.
    fn wait(&self, scope: &WaitScope) -> Result<V, Error>;

    fn is_cancelled(&self) -> bool;

    fn cancel(&self);
}

enum State<V> {
    Pending,
    Completed(V),
    Cancelled,
}

/// A future whose value is supplied exactly once by a producer.
///
/// See the [module-level documentation](self) for more information.
pub struct Completeable<V> {
    state: Mutex<State<V>>,
    // Notified after `state` leaves `Pending`, never before.
    settled: Event,
}

impl<V> Completeable<V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            settled: Event::new(),
        }
    }

    /// Supply the value, waking everyone waiting for it.
    ///
    /// Fails with [Error::AlreadyCompleted] if a value was already supplied
    /// and with [Error::Cancelled] if the future was cancelled; in both cases
    /// `val` is dropped and the future is left as it was.
    pub fn complete(&self, val: V) -> Result<(), Error> {
        {
            let mut state = self.lock();

            match &*state {
                State::Completed(_) => return Err(Error::AlreadyCompleted),
                State::Cancelled => return Err(Error::Cancelled),
                State::Pending => {}
            }

            *state = State::Completed(val);
        }

        debug!("future completed");
        self.settled.notify_all();

        Ok(())
    }

    /// Give up on the value, waking everyone waiting for it. Calling this more
    /// than once, or after the future completed, has no effect.
    pub fn cancel(&self) {
        {
            let mut state = self.lock();

            if !matches!(*state, State::Pending) {
                return;
            }

            *state = State::Cancelled;
        }

        debug!("future cancelled");
        self.settled.notify_all();
    }

    /// Whether the future has been cancelled. Producers can check this to
    /// skip computing a value nobody will see.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), State::Cancelled)
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.lock(), State::Completed(_))
    }

    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone> Completeable<V> {
    /// Returns a future resolving to the value, to [Error::Cancelled] if the
    /// future is cancelled, or to [Error::Abandoned] if `scope` ends first.
    /// The returned future can be polled by any executor; a deadline on
    /// `scope` wakes it on its own.
    pub fn get<'a>(&'a self, scope: &'a WaitScope) -> Get<'a, V> {
        Get::new(self, scope)
    }

    /// Blocking version of [Completeable::get] for use outside of async
    /// tasks.
    pub fn wait(&self, scope: &WaitScope) -> Result<V, Error> {
        let mut get = Get::new(self, scope);
        park_on(Pin::new(&mut get), scope.deadline())
    }

    fn outcome(&self) -> Option<Result<V, Error>> {
        match &*self.lock() {
            State::Pending => None,
            State::Completed(val) => Some(Ok(val.clone())),
            State::Cancelled => Some(Err(Error::Cancelled)),
        }
    }
}

impl<V> Default for Completeable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Completeable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.lock() {
            State::Pending => "pending",
            State::Completed(_) => "completed",
            State::Cancelled => "cancelled",
        };

        f.debug_struct("Completeable").field("state", &state).finish()
    }
}

impl<V: Clone> Deferred<V> for Completeable<V> {
    fn get<'a>(&'a self, scope: &'a WaitScope) -> impl Future<Output = Result<V, Error>> + 'a {
        Completeable::get(self, scope)
    }

    fn wait(&self, scope: &WaitScope) -> Result<V, Error> {
        Completeable::wait(self, scope)
    }

    fn is_cancelled(&self) -> bool {
        Completeable::is_cancelled(self)
    }

    fn cancel(&self) {
        Completeable::cancel(self)
    }
}

/// Future returned by [Completeable::get].
pub struct Get<'a, V> {
    fut: &'a Completeable<V>,
    scope: &'a WaitScope,
    settled_key: Option<usize>,
    scope_key: Option<usize>,
}

impl<'a, V> Get<'a, V> {
    fn new(fut: &'a Completeable<V>, scope: &'a WaitScope) -> Self {
        Self {
            fut,
            scope,
            settled_key: None,
            scope_key: None,
        }
    }
}

impl<V: Clone> Future for Get<'_, V> {
    type Output = Result<V, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        // Register before looking so that a transition in between still
        // wakes us.
        this.fut.settled.register(&mut this.settled_key, cx.waker());
        this.scope.done().register(&mut this.scope_key, cx.waker());

        // If both have ended, the future's own outcome wins.
        if let Some(outcome) = this.fut.outcome() {
            return Poll::Ready(outcome);
        }

        if let Some(reason) = this.scope.reason() {
            return Poll::Ready(Err(reason.into()));
        }

        this.scope.watch_deadline();

        Poll::Pending
    }
}

impl<V> Drop for Get<'_, V> {
    fn drop(&mut self) {
        self.fut.settled.deregister(&mut self.settled_key);
        self.scope.done().deregister(&mut self.scope_key);
    }
}

#[cfg(test)]
mod tests {
    use super::{Completeable, Deferred, Error};
    use crate::{
        scope::{Abandoned, WaitScope},
        task::Executor,
    };
    use anyhow::Result;
    use std::{
        future::Future,
        pin::pin,
        sync::{Arc, Barrier},
        task::{Context, Poll, Wake, Waker},
        thread,
        time::{Duration, Instant},
    };

    #[test]
    fn complete_then_get() -> Result<()> {
        let fut = Arc::new(Completeable::<String>::new());
        fut.complete(String::from("hello"))?;

        let v = Executor::block_on(async move { fut.get(&WaitScope::new()).await })?;
        assert_eq!(v, "hello");

        Ok(())
    }

    #[test]
    fn cancel_then_get() {
        let fut = Completeable::<String>::new();
        fut.cancel();

        assert_eq!(fut.wait(&WaitScope::new()), Err(Error::Cancelled));
        assert!(fut.is_cancelled());
        assert!(!fut.is_complete());
    }

    #[test]
    fn scope_expires_while_blocked() {
        let fut = Completeable::<String>::new();
        let before = Instant::now();

        let res = fut.wait(&WaitScope::with_timeout(Duration::from_millis(10)));

        assert_eq!(res, Err(Error::Abandoned(Abandoned::DeadlineExceeded)));
        assert!(before.elapsed() >= Duration::from_millis(10));
        assert!(before.elapsed() < Duration::from_millis(500));
        assert!(!fut.is_cancelled());
        assert!(!fut.is_complete());
    }

    #[test]
    fn scope_expires_in_task() {
        let fut = Arc::new(Completeable::<String>::new());
        let before = Instant::now();

        let res = {
            let fut = fut.clone();
            Executor::block_on(async move {
                let scope = WaitScope::with_timeout(Duration::from_millis(10));
                fut.get(&scope).await
            })
        };

        assert_eq!(res, Err(Error::Abandoned(Abandoned::DeadlineExceeded)));
        assert!(before.elapsed() >= Duration::from_millis(10));
        assert!(before.elapsed() < Duration::from_millis(500));
        assert_eq!(fut.settled.waiter_count(), 0);
    }

    #[test]
    fn second_complete_fails() -> Result<()> {
        let fut = Completeable::new();

        fut.complete("x")?;
        assert_eq!(fut.complete("y"), Err(Error::AlreadyCompleted));
        assert_eq!(fut.wait(&WaitScope::new())?, "x");

        Ok(())
    }

    #[test]
    fn at_most_one_completion() -> Result<()> {
        const N: usize = 16;
        let fut = Arc::new(Completeable::<usize>::new());
        let barrier = Arc::new(Barrier::new(N));

        let threads: Vec<_> = (0..N)
            .map(|i| {
                let fut = fut.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    (i, fut.complete(i))
                })
            })
            .collect();

        let mut winners = Vec::new();
        for t in threads {
            match t.join().unwrap() {
                (i, Ok(())) => winners.push(i),
                (_, Err(e)) => assert_eq!(e, Error::AlreadyCompleted),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(fut.wait(&WaitScope::new())?, winners[0]);

        Ok(())
    }

    #[test]
    fn late_cancel_keeps_completion() -> Result<()> {
        let fut = Completeable::new();

        fut.complete(7)?;
        fut.cancel();

        assert!(!fut.is_cancelled());
        assert_eq!(fut.wait(&WaitScope::new())?, 7);
        assert_eq!(fut.wait(&WaitScope::new())?, 7);

        Ok(())
    }

    #[test]
    fn cancel_blocks_completion() {
        let fut = Completeable::new();

        fut.cancel();

        assert_eq!(fut.complete(7), Err(Error::Cancelled));
        assert_eq!(fut.wait(&WaitScope::new()), Err(Error::Cancelled));
        assert_eq!(fut.wait(&WaitScope::new()), Err(Error::Cancelled));
    }

    #[test]
    fn cancel_is_idempotent() {
        let fut = Arc::new(Completeable::<u32>::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let fut = fut.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        fut.cancel();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert!(fut.is_cancelled());
        assert_eq!(fut.wait(&WaitScope::new()), Err(Error::Cancelled));
    }

    #[test]
    fn late_observer_does_not_block() -> Result<()> {
        let fut = Completeable::new();
        fut.complete(3)?;

        // The scope has already ended; the future's outcome still wins.
        let scope = WaitScope::new();
        scope.cancel();

        let mut cx = Context::from_waker(Waker::noop());
        let get = pin!(fut.get(&scope));
        assert_eq!(get.poll(&mut cx), Poll::Ready(Ok(3)));

        Ok(())
    }

    #[test]
    fn cancelled_scope_leaves_other_waiters_alone() -> Result<()> {
        let fut = Arc::new(Completeable::<String>::new());
        let scope_a = WaitScope::new();

        let waiter_a = {
            let fut = fut.clone();
            let scope = scope_a.clone();
            thread::spawn(move || fut.wait(&scope))
        };
        let waiter_b = {
            let fut = fut.clone();
            thread::spawn(move || fut.wait(&WaitScope::new()))
        };

        thread::sleep(Duration::from_millis(50));
        scope_a.cancel();

        assert_eq!(
            waiter_a.join().unwrap(),
            Err(Error::Abandoned(Abandoned::Cancelled))
        );
        assert!(!fut.is_cancelled());
        assert!(!waiter_b.is_finished());

        fut.complete(String::from("done"))?;
        assert_eq!(waiter_b.join().unwrap()?, "done");

        Ok(())
    }

    #[test]
    fn completion_wakes_tasks_and_threads() -> Result<()> {
        let fut = Arc::new(Completeable::<u64>::new());

        let blocked = {
            let fut = fut.clone();
            thread::spawn(move || fut.wait(&WaitScope::new()))
        };

        let producer = {
            let fut = fut.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                fut.complete(42u64)
            })
        };

        let results = Executor::block_on(async move {
            let tasks: Vec<_> = (0..4)
                .map(|_| {
                    let fut = fut.clone();
                    Executor::spawn(async move { fut.get(&WaitScope::new()).await })
                })
                .collect();

            let mut results = Vec::new();
            for t in tasks {
                results.push(t.await);
            }
            results
        });

        producer.join().unwrap()?;
        assert_eq!(results, vec![Ok(42); 4]);
        assert_eq!(blocked.join().unwrap()?, 42);

        Ok(())
    }

    #[test]
    fn cancellation_wakes_tasks() {
        let fut = Arc::new(Completeable::<u64>::new());

        let canceller = {
            let fut = fut.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                fut.cancel();
            })
        };

        let before = Instant::now();
        let res = {
            let fut = fut.clone();
            Executor::block_on(async move {
                let scope = WaitScope::with_timeout(Duration::from_secs(10));
                fut.get(&scope).await
            })
        };

        assert_eq!(res, Err(Error::Cancelled));
        assert!(before.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn complete_and_cancel_race_to_one_outcome() {
        for _ in 0..64 {
            let fut = Arc::new(Completeable::<u8>::new());
            let barrier = Arc::new(Barrier::new(2));

            let completer = {
                let fut = fut.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    fut.complete(1u8)
                })
            };
            let canceller = {
                let fut = fut.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    fut.cancel();
                })
            };

            let completed = completer.join().unwrap();
            canceller.join().unwrap();

            match completed {
                Ok(()) => {
                    assert!(!fut.is_cancelled());
                    assert_eq!(fut.wait(&WaitScope::new()), Ok(1));
                }
                Err(e) => {
                    assert_eq!(e, Error::Cancelled);
                    assert!(!fut.is_complete());
                    assert_eq!(fut.wait(&WaitScope::new()), Err(Error::Cancelled));
                }
            }
        }
    }

    struct Unparker(thread::Thread);

    impl Wake for Unparker {
        fn wake(self: Arc<Self>) {
            self.0.unpark();
        }
    }

    #[test]
    fn deadline_wakes_any_waker() {
        let fut = Completeable::<String>::new();
        let scope = WaitScope::with_timeout(Duration::from_millis(10));
        let waker = Waker::from(Arc::new(Unparker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut get = pin!(fut.get(&scope));
        let before = Instant::now();

        // Park without a timeout of our own: only a wakeup can get us out,
        // and the test harness would hang if none came.
        let res = loop {
            if let Poll::Ready(res) = get.as_mut().poll(&mut cx) {
                break res;
            }
            thread::park();
        };

        assert_eq!(res, Err(Error::Abandoned(Abandoned::DeadlineExceeded)));
        assert!(before.elapsed() >= Duration::from_millis(10));
        assert!(before.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn huge_timeout_waits_for_the_future() -> Result<()> {
        let fut = Arc::new(Completeable::<u8>::new());

        let producer = {
            let fut = fut.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                fut.complete(5)
            })
        };

        let res = fut.wait(&WaitScope::with_timeout(Duration::MAX));

        producer.join().unwrap()?;
        assert_eq!(res, Ok(5));

        Ok(())
    }

    #[test]
    fn dropped_get_deregisters() {
        let fut = Completeable::<u8>::new();
        let scope = WaitScope::new();
        let mut cx = Context::from_waker(Waker::noop());

        {
            let mut get = pin!(fut.get(&scope));
            assert!(get.as_mut().poll(&mut cx).is_pending());
            assert!(get.as_mut().poll(&mut cx).is_pending());
            assert_eq!(fut.settled.waiter_count(), 1);
            assert_eq!(scope.done().waiter_count(), 1);
        }

        assert_eq!(fut.settled.waiter_count(), 0);
        assert_eq!(scope.done().waiter_count(), 0);
    }

    #[test]
    fn usable_through_trait() -> Result<()> {
        fn consume<D: Deferred<u8>>(d: &D) -> Result<u8, Error> {
            if d.is_cancelled() {
                return Err(Error::Cancelled);
            }
            d.wait(&WaitScope::new())
        }

        let fut = Completeable::<u8>::new();
        fut.complete(9)?;
        assert_eq!(consume(&fut)?, 9);

        let fut = Completeable::<u8>::new();
        Deferred::cancel(&fut);
        assert_eq!(consume(&fut), Err(Error::Cancelled));

        Ok(())
    }

    #[test]
    fn errors_display() {
        assert_eq!(Error::AlreadyCompleted.to_string(), "future already complete");
        assert_eq!(Error::Cancelled.to_string(), "future canceled");
        assert_eq!(
            Error::from(Abandoned::DeadlineExceeded).to_string(),
            "wait scope deadline exceeded"
        );
    }
}
