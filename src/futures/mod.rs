//! Future sub-modules.
//!
//! The `futures` module holds the futures and synchronisation primitives
//! provided by this crate. Each of them can be `.await`ed from a task running
//! on the [Executor](crate::task::Executor) or any other executor, and the
//! ones that hand values between threads can also be waited on from plain
//! threads.
//!
//! The following sub-modules are exposed by the `futures` module:
//!
//! - `completeable`: The write-once, cancellable future at the heart of the
//!   crate.
//! - `event`: One-shot broadcast events for inter-task signalling.
pub mod completeable;
pub mod event;
