//! Cooperative multitasking module.
//!
//! With this module you can:
//! - spawn and join fibers ([`spawn`], [`JoinHandle`]),
//! - suspend the current fiber for a fixed duration ([`sleep`]) or until the
//!   next tick ([`yield_now`]),
//! - cancel a fiber that is currently parked ([`cancel`]).
//!
//! See also [`crate::channel`] for inter-fiber communication and
//! [`crate::sync`] for condition-variable/mutex-style synchronization.

use std::future::Future;
use std::time::Duration;

use crate::runtime::Runtime;
use crate::task::{await_once, Task};

pub use crate::task::JoinHandle;

/// Spawns `future` as a new fiber, scheduling it to run on the next tick,
/// and returns a handle that can be [joined][JoinHandle::join] for its
/// result.
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    Runtime::with(|rt| rt.spawn(future))
}

/// Cancels `task`: unparks it from whatever listener or timeout it's
/// currently waiting on. Safe to call on a task that has already
/// completed (a no-op).
pub fn cancel<T>(handle: &JoinHandle<T>) {
    Runtime::with(|rt| rt.cancel(handle.task()));
}

/// Suspends the current fiber until the next tick of the loop, without
/// registering any timeout or listener. Equivalent to the reference
/// implementation's bare `(yield)`/`ev.give`-less await.
pub async fn yield_now() {
    Runtime::with(|rt| {
        if let Some(current) = rt.current_task() {
            rt.schedule(current);
        }
    });
    await_once().await;
}

/// Suspends the current fiber for `duration`, then resumes it.
pub async fn sleep(duration: Duration) {
    let current = Runtime::with(|rt| rt.current_task())
        .expect("fiber::sleep() called outside of a running fiber");
    Runtime::with(|rt| rt.add_timeout(current, duration.as_secs_f64()));
    await_once().await;
}

/// The current monotonic time, in milliseconds since this thread's
/// `Runtime` was created.
pub fn time_ms() -> u64 {
    Runtime::with(|rt| rt.now_ms())
}

/// Runs the event loop until there is no more work scheduled: no ready
/// fibers, no pending timeouts, no active listeners.
pub fn run() {
    Runtime::with(|rt| rt.run());
}

/// Drives the loop forward by a single tick. Exposed for callers (and
/// [`JoinHandle::join`]) that want to pump the loop themselves rather than
/// calling [`run`].
pub fn tick() {
    Runtime::with(|rt| rt.tick());
}

/// The task currently executing, if called from within a fiber.
pub(crate) fn current() -> Option<std::rc::Rc<Task>> {
    Runtime::with(|rt| rt.current_task())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn spawn_and_join_returns_value() {
        let handle = spawn(async { 1 + 1 });
        assert_eq!(handle.join(), 2);
    }

    #[test]
    fn yield_now_lets_other_fibers_run() {
        let order = Rc::new(Cell::new(Vec::<u8>::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let a = spawn(async move {
            let mut v = (*o1).take();
            v.push(1);
            o1.set(v);
            yield_now().await;
            let mut v = (*o1).take();
            v.push(3);
            o1.set(v);
        });
        let b = spawn(async move {
            let mut v = (*o2).take();
            v.push(2);
            o2.set(v);
        });
        a.join();
        b.join();
        assert_eq!(order.take(), vec![1, 2, 3]);
    }

    #[test]
    fn sleep_orders_by_duration() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let long = spawn(async move {
            sleep(Duration::from_millis(20)).await;
            o1.borrow_mut().push("long");
        });
        let short = spawn(async move {
            sleep(Duration::from_millis(1)).await;
            o2.borrow_mut().push("short");
        });
        short.join();
        long.join();
        assert_eq!(*order.borrow(), vec!["short", "long"]);
    }

    #[test]
    fn panicking_fiber_does_not_poison_the_loop() {
        let handle = spawn(async { 7 });
        let panicker = spawn(async { panic!("boom") });
        assert_eq!(handle.join(), 7);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| panicker.join()));
        assert!(result.is_err());
    }
}
