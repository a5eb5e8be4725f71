//! Ambient fiber-friendly synchronization primitives: [`Cond`] and
//! [`Latch`].
//!
//! Neither is required by the channel/loop core itself — the reference
//! implementation's fibers only ever synchronize over channels — but the
//! teacher crate ships condition-variable and mutex primitives alongside
//! its channels (`fiber::Cond`, `fiber::Latch`/`LatchGuard`), and a complete
//! crate in that idiom does the same, built here on the same suspension
//! primitive ([`crate::task::await_once`]) as everything else.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::fiber;
use crate::ring::RingQueue;
use crate::runtime::Runtime;
use crate::task::{await_once, Task};

/// A condition variable: fibers [`wait`][Cond::wait] on it until another
/// fiber calls [`signal`][Cond::signal] (wakes one waiter) or
/// [`broadcast`][Cond::broadcast] (wakes all of them).
#[derive(Default)]
pub struct Cond {
    waiters: RefCell<RingQueue<Rc<Task>>>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspends the calling fiber until woken by [`signal`][Self::signal]
    /// or [`broadcast`][Self::broadcast].
    pub async fn wait(&self) {
        let current = fiber::current().expect("Cond::wait() called outside of a running fiber");
        self.waiters.borrow_mut().push(current).ok();
        await_once().await;
    }

    /// Wakes one waiting fiber, if any.
    pub fn signal(&self) {
        if let Some(task) = self.waiters.borrow_mut().pop() {
            Runtime::with(|rt| rt.schedule(task));
        }
    }

    /// Wakes every currently-waiting fiber.
    pub fn broadcast(&self) {
        while let Some(task) = self.waiters.borrow_mut().pop() {
            Runtime::with(|rt| rt.schedule(task));
        }
    }
}

/// A cooperative mutual-exclusion lock.
///
/// Since this crate is single-threaded, `Latch` cannot protect against data
/// races in the usual sense; what it protects against is *interleaving*
/// across suspension points, e.g. ensuring only one fiber at a time runs
/// the critical section between a `sleep().await` and the code after it.
#[derive(Default)]
pub struct Latch {
    locked: Cell<bool>,
    waiters: RefCell<RingQueue<Rc<Task>>>,
}

/// An RAII guard that unlocks its [`Latch`] on drop.
pub struct LatchGuard<'a> {
    latch: &'a Latch,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, suspending the calling fiber while it is held by
    /// someone else.
    pub async fn lock(&self) -> LatchGuard<'_> {
        loop {
            if !self.locked.replace(true) {
                return LatchGuard { latch: self };
            }
            let current =
                fiber::current().expect("Latch::lock() called outside of a running fiber");
            self.waiters.borrow_mut().push(current).ok();
            await_once().await;
        }
    }

    /// Acquires the lock only if it is currently free, without suspending.
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        if self.locked.replace(true) {
            None
        } else {
            Some(LatchGuard { latch: self })
        }
    }

    fn unlock(&self) {
        self.locked.set(false);
        if let Some(task) = self.waiters.borrow_mut().pop() {
            Runtime::with(|rt| rt.schedule(task));
        }
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn signal_wakes_a_single_waiter() {
        let cond = Rc::new(Cond::new());
        let c1 = cond.clone();
        let woken = Rc::new(Cell::new(false));
        let w = woken.clone();
        let waiter = fiber::spawn(async move {
            c1.wait().await;
            w.set(true);
        });
        fiber::tick();
        assert!(!woken.get());
        cond.signal();
        waiter.join();
        assert!(woken.get());
    }

    #[test]
    fn latch_serializes_critical_section() {
        let latch = Rc::new(Latch::new());
        let log = Rc::new(StdRefCell::new(Vec::new()));
        let l1 = latch.clone();
        let l2 = latch.clone();
        let log1 = log.clone();
        let log2 = log.clone();
        let f1 = fiber::spawn(async move {
            let _guard = l1.lock().await;
            log1.borrow_mut().push("f1-enter");
            fiber::yield_now().await;
            log1.borrow_mut().push("f1-exit");
        });
        let f2 = fiber::spawn(async move {
            let _guard = l2.lock().await;
            log2.borrow_mut().push("f2-enter");
            log2.borrow_mut().push("f2-exit");
        });
        f1.join();
        f2.join();
        let log = log.borrow();
        let f1_exit = log.iter().position(|s| *s == "f1-exit").unwrap();
        let f2_enter = log.iter().position(|s| *s == "f2-enter").unwrap();
        assert!(f1_exit < f2_enter);
    }
}
