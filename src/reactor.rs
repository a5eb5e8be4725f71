//! The Linux epoll/timerfd readiness back-end.
//!
//! Registration is always edge-triggered (`EPOLLET`), including read-only
//! or write-only interest, matching the reference loop's own registration
//! policy. The timer file descriptor is registered exactly once, at
//! construction, tagged with a null `epoll_data` user pointer so it can be
//! told apart from real pollables in the returned event batch.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{abort_on_backend_failure, Result};
use crate::pollable::Interest;

/// Default number of epoll events drained per `wait` call, matching the
/// reference implementation's batch size.
pub const DEFAULT_EVENT_BATCH: usize = 64;

/// One readiness event returned from [`Reactor::wait`].
pub struct RawEvent {
    /// `None` for the timer's own wakeup, `Some(fd)` for a real pollable.
    pub fd: Option<RawFd>,
    pub readable: bool,
    pub writable: bool,
}

/// Owns the epoll instance and the timerfd used to drive timeouts.
pub struct Reactor {
    epoll_fd: RawFd,
    timer_fd: RawFd,
}

fn check(ret: libc::c_int, _what: &str) -> io::Result<libc::c_int> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn retry_eintr<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn events_for(mask: Interest) -> u32 {
    let mut events = libc::EPOLLET as u32;
    if mask.contains(Interest::READ) {
        events |= libc::EPOLLIN as u32;
    }
    if mask.contains(Interest::WRITE) {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let epoll_fd = retry_eintr(|| unsafe {
            check(libc::epoll_create1(libc::EPOLL_CLOEXEC), "epoll_create1")
        })?;
        let timer_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_CLOEXEC | libc::TFD_NONBLOCK)
        };
        if timer_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err.into());
        }

        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = libc::EPOLLIN as u32 | libc::EPOLLET as u32;
        ev.u64 = 0; // null-pointer sentinel: the timer's own event
        retry_eintr(|| unsafe {
            check(
                libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, timer_fd, &mut ev),
                "epoll_ctl(timerfd)",
            )
        })?;

        Ok(Reactor { epoll_fd, timer_fd })
    }

    /// Registers `fd` for `mask`, tagging the epoll event with `fd` itself
    /// so it can be recovered from [`RawEvent::fd`].
    pub fn register(&self, fd: RawFd, mask: Interest) -> Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events_for(mask);
        ev.u64 = (fd as u64) | (1u64 << 63); // tag bit distinguishes from the timer sentinel (0)
        retry_eintr(|| unsafe {
            check(libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev), "epoll_ctl(add)")
        })?;
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, mask: Interest) -> Result<()> {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events_for(mask);
        ev.u64 = (fd as u64) | (1u64 << 63);
        retry_eintr(|| unsafe {
            check(libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev), "epoll_ctl(mod)")
        })?;
        Ok(())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        retry_eintr(|| unsafe {
            check(
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()),
                "epoll_ctl(del)",
            )
        })?;
        Ok(())
    }

    /// Arms (or disarms, if `delay_ms` is `None`) the timerfd to fire
    /// `delay_ms` from now.
    ///
    /// This is a relative (not `TFD_TIMER_ABSTIME`) arming: the runtime's
    /// timeout heap tracks deadlines in milliseconds since its own
    /// `Instant` epoch, which has no defined relationship to the kernel's
    /// `CLOCK_MONOTONIC` zero, so an absolute `CLOCK_MONOTONIC` deadline
    /// built from a heap deadline would be meaningless. The caller is
    /// expected to have already converted "deadline minus now" into
    /// `delay_ms`.
    pub fn arm_timer(&self, delay_ms: Option<u64>) -> Result<()> {
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        if let Some(ms) = delay_ms {
            spec.it_value.tv_sec = (ms / 1000) as libc::time_t;
            spec.it_value.tv_nsec = ((ms % 1000) * 1_000_000) as i64;
            // timerfd_settime rejects an all-zero it_value as "disarm", so
            // nudge a due-immediately deadline forward by one nanosecond.
            if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
                spec.it_value.tv_nsec = 1;
            }
        }
        retry_eintr(|| unsafe {
            check(libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()), "timerfd_settime")
        })?;
        Ok(())
    }

    /// Blocks until at least one event is ready, writing up to `batch.len()`
    /// of them into `batch` and returning how many were written.
    ///
    /// Any failure other than `EINTR` is fatal: see
    /// [`abort_on_backend_failure`].
    pub fn wait(&self, batch: &mut [libc::epoll_event]) -> usize {
        loop {
            let n = unsafe {
                libc::epoll_wait(self.epoll_fd, batch.as_mut_ptr(), batch.len() as libc::c_int, -1)
            };
            if n >= 0 {
                return n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            abort_on_backend_failure("epoll_wait", err);
        }
    }

    /// Drains the timerfd's expiration counter after a timer wakeup, as
    /// edge-triggered semantics require.
    pub fn drain_timer(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.timer_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n >= 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => return,
            }
        }
    }

    pub fn decode(&self, ev: &libc::epoll_event) -> RawEvent {
        let tagged = ev.u64 & (1u64 << 63) != 0;
        let fd = if tagged { Some((ev.u64 & !(1u64 << 63)) as RawFd) } else { None };
        RawEvent {
            fd,
            readable: ev.events & (libc::EPOLLIN as u32) != 0,
            writable: ev.events & (libc::EPOLLOUT as u32) != 0,
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
            libc::close(self.epoll_fd);
        }
    }
}
