//! Task and execution management
//!
//! This module provides the executor needed to drive async waits to
//! completion. Execution is per-thread: each OS thread that wants to run
//! tasks has its own executor. This means that:
//!
//! 1. The thread upon which a task is spawned is the same thread that will
//!    execute it.
//! 2. Each thread needs to call [Executor::block_on] to do any work. Tasks
//!    spawned by the top-level future run alongside it, and `block_on` only
//!    returns once every one of them has finished.
//!
//! Wakers handed out by the executor may be woken from *any* thread. That is
//! what lets a producer on one thread complete a
//! [Completeable](crate::futures::completeable::Completeable) that tasks on
//! another thread are awaiting.
//!
//! # Example
//!
//! ```
//! use completeable::task::Executor;
//! let x = Executor::block_on(async { 2 + 8 });
//! assert_eq!(x, 10);
//! ```
//!
//! # Threading Model
//!
//! Since each thread has its own execution state, tasks spawned on a thread
//! never run concurrently with each other, and the top-level future doesn't
//! need to be `Send`:
//!
//! ```
//! use completeable::task::Executor;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! let cell = Rc::new(RefCell::new(0));
//! let total = {
//!     let cell = cell.clone();
//!     Executor::block_on(async move {
//!         *cell.borrow_mut() += 10;
//!         *cell.borrow()
//!     })
//! };
//! assert_eq!(total, 10);
//! ```
use std::{
    cell::RefCell,
    future::Future,
    mem,
    pin::Pin,
    sync::{
        mpsc::{sync_channel, Receiver},
        Arc, Mutex, PoisonError,
    },
    task::{Context, Poll, Wake, Waker},
    thread::{self, Thread},
    time::Instant,
};

use log::trace;
use slab::Slab;

use crate::{
    futures::event::Event,
    reactor::{Notifier, Reactor},
};

/// Keys of tasks woken since the executor last looked, shared with every
/// waker the executor hands out.
struct WokenQueue {
    keys: Mutex<Vec<usize>>,
    notifier: Arc<Notifier>,
}

struct TaskId {
    key: usize,
    queue: Arc<WokenQueue>,
}

impl Wake for TaskId {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.key);
        self.queue.notifier.notify();
    }
}

struct Task {
    id: Arc<TaskId>,
    future: Pin<Box<dyn Future<Output = ()>>>,
}

enum Next {
    Run(usize, Task),
    Idle,
    Done,
}

/// The async executor.
///
/// A type that is responsible for pushing futures through to
/// completion. You can begin execution of a new task by calling the
/// [Executor::block_on] function.
pub struct Executor {
    // A slot is `None` while its task is being polled.
    tasks: Slab<Option<Task>>,
    run_q: Vec<usize>,
    woken: Arc<WokenQueue>,
}

thread_local! {
    static EXEC: RefCell<Executor> = RefCell::new(Executor::new());
}

/// A handle to a running task.
///
/// Await the joiner from another task to get the future's value;
/// [TaskJoiner::join] blocks for it once the executor has run. If the joiner
/// is dropped then execution of the future continues to completion but the
/// return value is lost, aka detach-on-drop.
pub(crate) struct TaskJoiner<T> {
    rx: Receiver<T>,
    finished: Arc<Event>,
    key: Option<usize>,
}

impl<T> TaskJoiner<T> {
    /// Block until the task has finished and yield its value. Only called
    /// from a synchronous context.
    fn join(self) -> T {
        self.rx
            .recv()
            .expect("task was dropped before it finished")
    }
}

impl<T> Future for TaskJoiner<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if !this.finished.register(&mut this.key, cx.waker()) {
            return Poll::Pending;
        }

        Poll::Ready(
            this.rx
                .recv()
                .expect("task was dropped before it finished"),
        )
    }
}

impl<T> Drop for TaskJoiner<T> {
    fn drop(&mut self) {
        self.finished.deregister(&mut self.key);
    }
}

impl Executor {
    fn new() -> Self {
        Self {
            tasks: Slab::new(),
            run_q: Vec::new(),
            woken: Arc::new(WokenQueue {
                keys: Mutex::new(Vec::new()),
                notifier: Reactor::notifier(),
            }),
        }
    }

    /// Spawn a new future and add it to this thread's run queue. The task
    /// runs the next time this thread's executor loop gets to it.
    ///
    /// A [TaskJoiner] is returned which can be used to wait for completion of
    /// the future `f` and obtain its return value.
    pub(crate) fn spawn<Fut, T>(f: Fut) -> TaskJoiner<T>
    where
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = sync_channel(1);
        let finished = Arc::new(Event::new());
        let evt = finished.clone();

        let fut = async move {
            let value = f.await;
            let _ = tx.send(value);
            evt.notify_all();
        };

        EXEC.with(|exec| {
            let mut exec = exec.borrow_mut();
            let queue = exec.woken.clone();
            let slot = exec.tasks.vacant_entry();
            let key = slot.key();

            slot.insert(Some(Task {
                id: Arc::new(TaskId { key, queue }),
                future: Box::pin(fut),
            }));
            exec.run_q.push(key);

            trace!("spawned task {}", key);
        });

        TaskJoiner {
            rx,
            finished,
            key: None,
        }
    }

    /// Run `f` to completion on this thread and return its value.
    ///
    /// Blocks until `f` and every task spawned on this thread in the meantime
    /// have finished. Idle periods are spent in the reactor, which wakes when
    /// a waker is called from any thread.
    pub fn block_on<Fut, T>(f: Fut) -> T
    where
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let joiner = Self::spawn(f);

        Self::executor_loop();

        joiner.join()
    }

    fn next_task(&mut self) -> Next {
        let woken = mem::take(
            &mut *self
                .woken
                .keys
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        self.run_q.extend(woken);

        if self.tasks.is_empty() {
            return Next::Done;
        }

        // Stale keys (finished tasks) and duplicates are skipped or cause a
        // spurious poll, both harmless.
        while let Some(key) = self.run_q.pop() {
            if let Some(task) = self.tasks.get_mut(key).and_then(Option::take) {
                return Next::Run(key, task);
            }
        }

        Next::Idle
    }

    fn executor_loop() {
        loop {
            match EXEC.with(|exec| exec.borrow_mut().next_task()) {
                Next::Run(key, mut task) => {
                    let waker = Waker::from(task.id.clone());
                    let mut cx = Context::from_waker(&waker);

                    trace!("polling task {}", key);

                    // Polling and dropping happen outside of the borrow so
                    // that tasks may spawn further tasks.
                    let task = match task.future.as_mut().poll(&mut cx) {
                        Poll::Ready(()) => {
                            drop(task);
                            None
                        }
                        Poll::Pending => Some(task),
                    };

                    EXEC.with(|exec| {
                        let mut exec = exec.borrow_mut();
                        match task {
                            Some(task) => exec.tasks[key] = Some(task),
                            None => {
                                exec.tasks.remove(key);
                                trace!("task {} finished", key);
                            }
                        }
                    });
                }
                Next::Idle => Reactor::react(),
                Next::Done => return,
            }
        }
    }
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drive `fut` to completion on the calling thread by parking it between
/// polls, without involving the executor. Parking is bounded by `deadline` so
/// that a future which resolves on time alone is re-polled when it is due.
pub(crate) fn park_on<F: Future>(mut fut: Pin<&mut F>, deadline: Option<Instant>) -> F::Output {
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);

    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }

        match deadline {
            Some(deadline) => {
                thread::park_timeout(deadline.saturating_duration_since(Instant::now()))
            }
            None => thread::park(),
        }
    }
}
