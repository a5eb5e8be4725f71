//! Tasks: the unit of cooperative scheduling.
//!
//! A [`Task`] is a boxed, type-erased top-level future plus the bookkeeping
//! fields the runtime needs to schedule it: whether it's already sitting on
//! the ready-queue, which listener (if any) it's parked on, and its slot in
//! the timeout heap. A task is always handled behind an `Rc`: it has no
//! single owner, and lives exactly as long as some queue, heap slot,
//! listener, or caller-held [`JoinHandle`] keeps a strong reference to it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::pollable::ListenerHandle;

/// Sentinel value of [`Task::timeout_index`] meaning "not in the heap".
pub const NO_TIMEOUT: isize = -1;

/// The outcome of polling a task once.
pub enum Signal {
    /// The task's future returned `Poll::Pending`; it's parked somewhere.
    Pending,
    /// The task's future completed.
    Done,
    /// The task's future panicked. Carries the panic payload, matching
    /// `std::panic::catch_unwind`'s own error type, so the caller can hand
    /// it to whatever diagnostic printer it likes.
    Panicked(Box<dyn Any + Send + 'static>),
}

/// A scheduled unit of work.
///
/// `scheduled` is true exactly while the task sits on the ready-queue,
/// preventing it from being double-pushed (invariant: a task appears at
/// most once in the ready-queue at any time). `waiting` holds the listener
/// this task is currently parked on, if any; a task has at most one
/// outstanding listener and at most one outstanding timeout simultaneously.
pub struct Task {
    pub(crate) scheduled: Cell<bool>,
    pub(crate) waiting: RefCell<Option<ListenerHandle>>,
    pub(crate) timeout_index: Cell<isize>,
    future: RefCell<Pin<Box<dyn Future<Output = ()>>>>,
}

impl Task {
    pub fn new<F>(future: F) -> Rc<Self>
    where
        F: Future<Output = ()> + 'static,
    {
        Rc::new(Task {
            scheduled: Cell::new(false),
            waiting: RefCell::new(None),
            timeout_index: Cell::new(NO_TIMEOUT),
            future: RefCell::new(Box::pin(future)),
        })
    }

    /// Polls the task's future once, inside `cx`, catching any panic.
    pub(crate) fn poll_once(self: &Rc<Self>, cx: &mut Context<'_>) -> Signal {
        let mut future = self.future.borrow_mut();
        let poll_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            future.as_mut().poll(cx)
        }));
        match poll_result {
            Ok(Poll::Ready(())) => Signal::Done,
            Ok(Poll::Pending) => Signal::Pending,
            Err(payload) => Signal::Panicked(payload),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("scheduled", &self.scheduled.get())
            .field("has_timeout", &(self.timeout_index.get() != NO_TIMEOUT))
            .finish()
    }
}

/// A leaf future that resolves to `Poll::Ready` exactly once it's woken,
/// having yielded `Poll::Pending` exactly once beforehand.
///
/// This is the realization of "a fiber yields to the loop by signalling the
/// `event` signal": whoever constructs an `AwaitOnce` has already arranged
/// for something (a reactor registration, a timeout heap entry, a channel
/// waiter slot) to wake this task's waker later.
pub struct AwaitOnce {
    armed: bool,
}

impl AwaitOnce {
    pub fn new() -> Self {
        AwaitOnce { armed: false }
    }
}

impl Default for AwaitOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl Future for AwaitOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.armed {
            Poll::Ready(())
        } else {
            self.armed = true;
            Poll::Pending
        }
    }
}

/// Awaits a single suspension point, matching `janet_await`'s "yield to the
/// loop with nil" behavior. Callers arrange the actual wakeup themselves
/// before or while this future is first polled.
pub async fn await_once() {
    AwaitOnce::new().await
}

/// An RAII handle to a spawned task's result.
///
/// Grounded on the teacher's `fiber::JoinHandle`: dropping a `JoinHandle`
/// without calling [`JoinHandle::join`] first panics, since a forgotten
/// join silently discards the distinction between "task is still running"
/// and "task finished a while ago", which is rarely what the caller wants.
pub struct JoinHandle<T> {
    task: Rc<Task>,
    slot: Rc<RefCell<Option<std::result::Result<T, Box<dyn Any + Send + 'static>>>>>,
    joined: bool,
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(
        task: Rc<Task>,
        slot: Rc<RefCell<Option<std::result::Result<T, Box<dyn Any + Send + 'static>>>>>,
    ) -> Self {
        JoinHandle { task, slot, joined: false }
    }

    /// Runs the loop until this task has completed, then returns its
    /// result, re-raising a captured panic by resuming its unwind.
    pub fn join(mut self) -> T {
        self.joined = true;
        loop {
            if let Some(result) = self.slot.borrow_mut().take() {
                return match result {
                    Ok(value) => value,
                    Err(payload) => std::panic::resume_unwind(payload),
                };
            }
            crate::runtime::Runtime::with(|rt| rt.tick());
        }
    }

    /// The underlying task, e.g. to pass to [`crate::fiber::cancel`].
    pub fn task(&self) -> &Rc<Task> {
        &self.task
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined && !std::thread::panicking() {
            panic!("JoinHandle dropped without being joined");
        }
    }
}

/// Builds a [`std::task::Waker`] that reschedules `task` on the ready-queue
/// when woken. Mirrors the teacher crate's own `Rc`-backed raw waker: the
/// waker is never sent across threads, so the `Send`/`Sync` impls below are
/// a formality satisfying `std::task::Waker`'s bounds, not a real safety
/// claim about concurrent access.
pub(crate) fn waker_for(task: Rc<Task>) -> std::task::Waker {
    unsafe { std::task::Waker::from_raw(raw_waker(task)) }
}

struct WakeTarget(Rc<Task>);
unsafe impl Send for WakeTarget {}
unsafe impl Sync for WakeTarget {}

fn raw_waker(task: Rc<Task>) -> std::task::RawWaker {
    const VTABLE: std::task::RawWakerVTable = std::task::RawWakerVTable::new(
        clone_raw,
        wake_raw,
        wake_by_ref_raw,
        drop_raw,
    );
    let boxed = Box::new(WakeTarget(task));
    std::task::RawWaker::new(Box::into_raw(boxed) as *const (), &VTABLE)
}

unsafe fn clone_raw(data: *const ()) -> std::task::RawWaker {
    let target = &*(data as *const WakeTarget);
    raw_waker(target.0.clone())
}

unsafe fn wake_raw(data: *const ()) {
    let target = Box::from_raw(data as *mut WakeTarget);
    crate::runtime::Runtime::with(|rt| rt.schedule(target.0.clone()));
}

unsafe fn wake_by_ref_raw(data: *const ()) {
    let target = &*(data as *const WakeTarget);
    crate::runtime::Runtime::with(|rt| rt.schedule(target.0.clone()));
}

unsafe fn drop_raw(data: *const ()) {
    drop(Box::from_raw(data as *mut WakeTarget));
}
