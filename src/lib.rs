//! # `completeable`: write-once, cancellable futures
//!
//! This crate provides a single concurrency primitive, the
//! [Completeable](futures::completeable::Completeable) future: a container
//! for a value that may not exist yet. One producer supplies the value at most
//! once, anyone may cancel it, and any number of threads or async tasks can
//! wait for it at the same time. Each wait is bounded by its own
//! [WaitScope](scope::WaitScope), which can be cancelled or given a deadline
//! without affecting the future or anyone else waiting on it.
//!
//! Async waits work under any executor: completion, cancellation and wait
//! scope deadlines all wake the waiting task through its own waker. For
//! convenience the crate carries a small per-thread executor in the [task]
//! module, backed by an `epoll` reactor that wakes on notifications from other
//! threads. Threads that don't run an executor can block with
//! [Completeable::wait](futures::completeable::Completeable::wait) instead.
//!
//! ## Example
//!
//! A producer thread hands a value to a task waiting with a one second
//! deadline:
//!
//! ```
//! use completeable::futures::completeable::Completeable;
//! use completeable::scope::WaitScope;
//! use completeable::task::Executor;
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! let fut = Arc::new(Completeable::<u32>::new());
//!
//! let producer = {
//!     let fut = fut.clone();
//!     thread::spawn(move || {
//!         if !fut.is_cancelled() {
//!             fut.complete(42).unwrap();
//!         }
//!     })
//! };
//!
//! let value = Executor::block_on(async move {
//!     let scope = WaitScope::with_timeout(Duration::from_secs(1));
//!     fut.get(&scope).await
//! });
//!
//! assert_eq!(value, Ok(42));
//! producer.join().unwrap();
//! ```
pub mod futures;
pub(crate) mod reactor;
pub mod scope;
pub mod task;
