use std::{
    io,
    mem::MaybeUninit,
    os::fd::{AsFd, AsRawFd},
    time::Duration,
};

const MAX_NUM_EVENTS: usize = 64;

pub(super) struct Events {
    inner: [MaybeUninit<libc::epoll_event>; MAX_NUM_EVENTS],
}

impl Events {
    pub const fn new() -> Self {
        Self {
            inner: [MaybeUninit::uninit(); MAX_NUM_EVENTS],
        }
    }

    /// Wait for events on the epoll instance `fd`. A `timeout` of `None`
    /// blocks indefinitely. Sub-millisecond remainders are rounded up so that
    /// the wait never ends early.
    pub fn wait(
        &mut self,
        fd: impl AsFd,
        timeout: Option<Duration>,
    ) -> io::Result<impl Iterator<Item = libc::epoll_event> + '_> {
        let timeout = match timeout {
            Some(d) => {
                let mut ms = d.as_millis();
                if d.subsec_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as i32
            }
            None => -1,
        };

        let mut n = unsafe {
            libc::epoll_wait(
                fd.as_fd().as_raw_fd(),
                self.inner.as_mut_ptr() as *mut _,
                MAX_NUM_EVENTS as i32,
                timeout,
            )
        };

        if n == -1 {
            let err = io::Error::last_os_error();

            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }

            n = 0;
        }

        Ok(self
            .inner
            .iter()
            .take(n as usize)
            .map(|x| unsafe { x.assume_init() }))
    }
}
