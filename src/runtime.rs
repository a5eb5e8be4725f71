//! The loop driver.
//!
//! [`Runtime`] holds all process-wide state behind a single `thread_local!`,
//! exactly as a cooperative single-threaded loop needs: one ready-queue, one
//! timeout heap, one reactor, one registry of live pollables. There is no
//! locking anywhere in this module because there is, by construction,
//! nothing else running on this thread while a tick executes.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Instant;

use futures::FutureExt;

use crate::heap::TimeoutHeap;
use crate::pollable::{Interest, Pollable};
use crate::reactor::{Reactor, DEFAULT_EVENT_BATCH};
use crate::ring::RingQueue;
use crate::task::{JoinHandle, Signal, Task};

thread_local! {
    static RUNTIME: Runtime = Runtime::bootstrap();
}

/// The process-wide (really: thread-wide) event loop state.
pub struct Runtime {
    ready_queue: RefCell<RingQueue<Rc<Task>>>,
    timeout_heap: RefCell<TimeoutHeap>,
    pollables: RefCell<HashMap<RawFd, Rc<RefCell<Pollable>>>>,
    registered_fds: RefCell<HashSet<RawFd>>,
    active_listener_count: Cell<usize>,
    reactor: Reactor,
    epoch: Instant,
    current: RefCell<Option<Rc<Task>>>,
}

impl Runtime {
    fn bootstrap() -> Self {
        Runtime {
            ready_queue: RefCell::new(RingQueue::new()),
            timeout_heap: RefCell::new(TimeoutHeap::new()),
            pollables: RefCell::new(HashMap::new()),
            registered_fds: RefCell::new(HashSet::new()),
            active_listener_count: Cell::new(0),
            reactor: Reactor::new().expect("failed to initialize epoll/timerfd reactor"),
            epoch: Instant::now(),
            current: RefCell::new(None),
        }
    }

    /// Runs `f` with access to this thread's `Runtime`.
    pub fn with<R>(f: impl FnOnce(&Runtime) -> R) -> R {
        RUNTIME.with(f)
    }

    /// Milliseconds elapsed since this runtime was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The task currently being polled, if any. Used by [`crate::pollable`]
    /// to find the current fiber when registering a listener.
    pub fn current_task(&self) -> Option<Rc<Task>> {
        self.current.borrow().clone()
    }

    /// Schedules `task` to resume, deduplicating against a task already
    /// sitting on the ready-queue.
    pub fn schedule(&self, task: Rc<Task>) {
        if task.scheduled.replace(true) {
            return;
        }
        self.ready_queue.borrow_mut().push(task).ok();
    }

    /// Spawns a new top-level future as a task and schedules it immediately.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: std::future::Future<Output = T> + 'static,
        T: 'static,
    {
        let slot = Rc::new(RefCell::new(None));
        let slot_for_task = slot.clone();
        let task = Task::new(async move {
            let result = std::panic::AssertUnwindSafe(future)
                .catch_unwind()
                .await;
            *slot_for_task.borrow_mut() = Some(result);
        });
        self.schedule(task.clone());
        JoinHandle::new(task, slot)
    }

    /// Cancels `task`: removes it from its listener (if parked on one) and
    /// from the timeout heap (if it has a pending timeout). Idempotent and
    /// safe to call on a task in any state.
    ///
    /// Does not reschedule the task, matching `janet_cancel`: a cancelled
    /// task is left suspended and holds no references from any queue, heap,
    /// or waiter list afterwards.
    pub fn cancel(&self, task: &Rc<Task>) {
        if let Some(handle) = task.waiting.borrow_mut().take() {
            handle.cancel();
        }
        self.timeout_heap.borrow_mut().remove(task);
    }

    /// Registers a pending timeout for `task`, firing `seconds` from now.
    pub fn add_timeout(&self, task: Rc<Task>, seconds: f64) -> u64 {
        let when = self.now_ms() + (seconds.max(0.0) * 1000.0).round() as u64;
        self.timeout_heap.borrow_mut().add(when, task);
        when
    }

    fn pollable_for(&self, fd: RawFd) -> Rc<RefCell<Pollable>> {
        self.pollables
            .borrow_mut()
            .entry(fd)
            .or_insert_with(|| Pollable::new(fd))
            .clone()
    }

    /// Registers `machine` on `fd` for `mask`, creating the pollable and
    /// registering it with the reactor if this is the first interest on
    /// `fd`, or updating the existing registration otherwise.
    pub fn listen(
        &self,
        fd: RawFd,
        machine: Box<dyn crate::pollable::Machine>,
        mask: Interest,
        owner: Option<Rc<Task>>,
        spawner: bool,
    ) -> crate::Result<crate::pollable::ListenerHandle> {
        let pollable = self.pollable_for(fd);
        let handle = Pollable::listen(&pollable, machine, mask, owner, spawner)?;
        let full_mask = pollable.borrow().mask();
        if self.registered_fds.borrow_mut().insert(fd) {
            self.reactor.register(fd, full_mask)?;
        } else {
            self.reactor.reregister(fd, full_mask)?;
        }
        self.active_listener_count.set(self.active_listener_count.get() + 1);
        Ok(handle)
    }

    pub(crate) fn on_listener_removed(&self, fd: RawFd) {
        if self.active_listener_count.get() > 0 {
            self.active_listener_count.set(self.active_listener_count.get() - 1);
        }
        if let Some(pollable) = self.pollables.borrow().get(&fd).cloned() {
            let mask = pollable.borrow().mask();
            if mask.is_empty() {
                let _ = self.reactor.deregister(fd);
                self.registered_fds.borrow_mut().remove(&fd);
                self.pollables.borrow_mut().remove(&fd);
            } else {
                let _ = self.reactor.reregister(fd, mask);
            }
        }
    }

    /// Enumerates every task reachable from live listeners, for an embedder
    /// that wants to run a tracing collector over task handles it obtained
    /// from this crate. The realization of `janet_ev_mark`/
    /// `janet_pollable_mark`.
    pub fn mark_reachable(&self, mut visitor: impl FnMut(&Rc<Task>)) {
        for pollable in self.pollables.borrow().values() {
            Pollable::mark_reachable(pollable, &mut visitor);
        }
    }

    /// One driver iteration, implementing the loop's per-tick algorithm:
    /// fire due timeouts, drain the ready-queue, then block on the reactor
    /// if anything is still outstanding.
    pub fn tick(&self) {
        let now = self.now_ms();
        while let Some(task) = self.timeout_heap.borrow_mut().pop_if_due(now) {
            self.schedule(task);
        }

        while let Some(task) = self.ready_queue.borrow_mut().pop() {
            task.scheduled.set(false);
            *self.current.borrow_mut() = Some(task.clone());
            let waker = crate::task::waker_for(task.clone());
            let mut cx = std::task::Context::from_waker(&waker);
            let signal = task.poll_once(&mut cx);
            *self.current.borrow_mut() = None;
            match signal {
                Signal::Pending => {}
                Signal::Done => {}
                Signal::Panicked(payload) => {
                    let msg = panic_message(&payload);
                    log::error!("fiber panicked: {msg}");
                }
            }
        }

        let have_listeners = self.active_listener_count.get() > 0;
        let deadline = self.timeout_heap.borrow().peek_deadline();
        if have_listeners || deadline.is_some() {
            let delay = deadline.map(|d| d.saturating_sub(self.now_ms()));
            self.reactor.arm_timer(delay).ok();
            let mut batch = vec![unsafe { std::mem::zeroed::<libc::epoll_event>() }; DEFAULT_EVENT_BATCH];
            let n = self.reactor.wait(&mut batch);
            for ev in &batch[..n] {
                let raw = self.reactor.decode(ev);
                match raw.fd {
                    None => self.reactor.drain_timer(),
                    Some(fd) => {
                        let mut ready = Interest::empty();
                        if raw.readable {
                            ready |= Interest::READ;
                        }
                        if raw.writable {
                            ready |= Interest::WRITE;
                        }
                        if let Some(pollable) = self.pollables.borrow().get(&fd).cloned() {
                            Pollable::dispatch(&pollable, ready);
                        }
                    }
                }
            }
        }
    }

    /// Runs [`Self::tick`] until there is nothing left to do: no ready
    /// tasks, no pending timeouts, no active listeners.
    pub fn run(&self) {
        loop {
            if self.ready_queue.borrow().is_empty()
                && self.timeout_heap.borrow().is_empty()
                && self.active_listener_count.get() == 0
            {
                break;
            }
            self.tick();
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
