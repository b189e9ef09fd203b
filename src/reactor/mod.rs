use std::{
    cell::RefCell,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::Arc,
};

use events::Events;
use log::trace;

mod events;

/// Wakes a reactor that may be blocked in `epoll_wait`. Safe to signal from
/// any thread.
pub(crate) struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn notify(&self) {
        let val: u64 = 1;

        // A saturated counter fails with EAGAIN but is still readable, which
        // is all the reactor needs.
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const _,
                mem::size_of::<u64>(),
            )
        };
    }

    fn drain(&self) {
        let mut val: u64 = 0;

        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut _,
                mem::size_of::<u64>(),
            )
        };
    }
}

pub(crate) struct Reactor {
    epoll: OwnedFd,
    notifier: Arc<Notifier>,
    events: RefCell<Events>,
}

thread_local! {
    static REACTOR: Reactor = Reactor::new().expect("failed to set up the thread's reactor");
}

impl Reactor {
    fn new() -> io::Result<Self> {
        let epoll = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };

        if epoll == -1 {
            return Err(io::Error::last_os_error());
        }

        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };
        let notifier = Notifier::new()?;

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: 0,
        };

        let ret = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                notifier.fd.as_raw_fd(),
                &mut event,
            )
        };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epoll,
            notifier: Arc::new(notifier),
            events: RefCell::new(Events::new()),
        })
    }

    /// A handle that other threads can use to wake this thread's reactor.
    pub fn notifier() -> Arc<Notifier> {
        REACTOR.with(|r| r.notifier.clone())
    }

    /// Block until this thread's [Notifier] is signalled. The wakers that
    /// signalled it have already queued their tasks with the executor.
    pub fn react() {
        REACTOR.with(|r| {
            trace!("reactor sleeping");

            let notified = r
                .events
                .borrow_mut()
                .wait(&r.epoll, None)
                .expect("epoll_wait failed")
                .count()
                > 0;

            if notified {
                r.notifier.drain();
            }

            trace!("reactor woke, notified: {}", notified);
        })
    }
}
