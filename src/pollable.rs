//! Pollables and the listener chains hung off them.
//!
//! A [`Pollable`] wraps one file descriptor's readiness state. Any number
//! of [`Listener`]s can be registered on it, each advancing its own
//! [`Machine`] state machine as `Read`/`Write`/`Close` events arrive. This
//! mirrors the reference implementation's `JanetListenerState` chain: a
//! singly-linked list, unlinked by a linear walk from the head, since
//! unregistration is not a hot path here.

use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::task::Task;

bitflags::bitflags! {
    /// Which events a listener (or a pollable's aggregate registration)
    /// cares about.
    pub struct Interest: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        /// Set on every listener's *recorded* mask unconditionally, mirroring
        /// `JANET_ASYNC_LISTEN_SPAWNER` in the reference implementation: it
        /// marks a listener that isn't anchored to the fiber that created it
        /// (e.g. an accept-loop listener serving every connection), so it can
        /// be told apart from an ordinary single-fiber listener without
        /// affecting which bits get registered with the reactor.
        const SPAWNER = 0b0100;
    }
}

/// Events delivered to a [`Machine`] as a listener's lifecycle progresses.
pub enum MachineEvent {
    Init,
    Deinit,
    Close,
    Mark,
    Read,
    Write,
}

/// Whether a machine has finished handling the interest it was registered
/// for and should be unlistened.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum StepResult {
    NotDone,
    Done,
}

/// A listener's event-driven state machine.
///
/// Implementors define what a single registered interest on a pollable
/// actually *does* (e.g. "read one edge-triggered chunk at a time until
/// EWOULDBLOCK"); this crate provides the chain and the event delivery, not
/// any concrete I/O state machine (out of scope, see the crate's `Purpose`
/// notes).
pub trait Machine {
    fn step(&mut self, event: MachineEvent, pollable: &Pollable) -> StepResult;
}

struct Listener {
    mask: Interest,
    machine: RefCell<Box<dyn Machine>>,
    fiber: Option<Rc<Task>>,
    next: RefCell<Option<Rc<Listener>>>,
}

/// A lightweight, `Clone`-able reference to a registered listener, used by
/// [`crate::task::Task::waiting`] to remember which listener a task is
/// parked on without the task needing to know about [`Pollable`] internals.
#[derive(Clone)]
pub struct ListenerHandle {
    pollable: Weak<RefCell<Pollable>>,
    listener: Rc<Listener>,
}

impl ListenerHandle {
    /// Unregisters the listener this handle refers to, if its pollable is
    /// still alive. A no-op otherwise (the pollable having already been
    /// dropped implies every one of its listeners was already deinited).
    pub fn cancel(&self) {
        if let Some(pollable) = self.pollable.upgrade() {
            let fd = pollable.borrow().fd;
            Pollable::unlisten(&pollable, &self.listener);
            crate::runtime::Runtime::with(|rt| rt.on_listener_removed(fd));
        }
    }
}

/// One file descriptor's registration state: the chain of listeners hung
/// off it and the union of interest bits currently registered with the
/// reactor.
pub struct Pollable {
    pub fd: RawFd,
    closed: Cell<bool>,
    head: RefCell<Option<Rc<Listener>>>,
    mask: Cell<Interest>,
}

impl Pollable {
    pub fn new(fd: RawFd) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Pollable {
            fd,
            closed: Cell::new(false),
            head: RefCell::new(None),
            mask: Cell::new(Interest::empty()),
        }))
    }

    /// The union of base (non-spawner) interest bits currently registered.
    pub fn mask(&self) -> Interest {
        self.mask.get() & (Interest::READ | Interest::WRITE)
    }

    /// Registers `machine` on `pollable` for `mask`.
    ///
    /// Fails with [`Error::DuplicateInterest`] if any currently-registered
    /// listener already watches one of the bits in `mask`, and with
    /// [`Error::FiberAlreadyWaiting`] if `owner` is `Some` and that task is
    /// already parked on a different listener.
    pub fn listen(
        pollable: &Rc<RefCell<Self>>,
        machine: Box<dyn Machine>,
        mask: Interest,
        owner: Option<Rc<Task>>,
        spawner: bool,
    ) -> Result<ListenerHandle> {
        let base_mask = mask & (Interest::READ | Interest::WRITE);
        {
            let this = pollable.borrow();
            if this.closed.get() {
                return Err(Error::Backend(std::io::Error::from(
                    std::io::ErrorKind::NotConnected,
                )));
            }
            if this.mask().intersects(base_mask) {
                return Err(Error::DuplicateInterest);
            }
        }
        if let Some(owner) = &owner {
            if owner.waiting.borrow().is_some() {
                return Err(Error::FiberAlreadyWaiting);
            }
        }

        let recorded_mask = if spawner { base_mask | Interest::SPAWNER } else { base_mask };
        let listener = Rc::new(Listener {
            mask: recorded_mask,
            machine: RefCell::new(machine),
            fiber: owner.clone(),
            next: RefCell::new(None),
        });

        {
            let this = pollable.borrow();
            *listener.next.borrow_mut() = this.head.borrow().clone();
        }
        pollable.borrow().head.replace(Some(listener.clone()));
        pollable.borrow().mask.set(pollable.borrow().mask() | base_mask);

        let handle = ListenerHandle {
            pollable: Rc::downgrade(pollable),
            listener: listener.clone(),
        };
        if let Some(owner) = &owner {
            if !spawner {
                *owner.waiting.borrow_mut() = Some(handle.clone());
            }
        }
        listener.machine.borrow_mut().step(MachineEvent::Init, &pollable.borrow());
        Ok(handle)
    }

    /// Removes `listener` from `pollable`'s chain, delivering `Deinit`
    /// first.
    fn unlisten(pollable: &Rc<RefCell<Self>>, listener: &Rc<Listener>) {
        listener.machine.borrow_mut().step(MachineEvent::Deinit, &pollable.borrow());

        let mut cursor = pollable.borrow().head.borrow().clone();
        let mut prev: Option<Rc<Listener>> = None;
        while let Some(node) = cursor {
            if Rc::ptr_eq(&node, listener) {
                let next = node.next.borrow().clone();
                match &prev {
                    Some(p) => *p.next.borrow_mut() = next,
                    None => *pollable.borrow().head.borrow_mut() = next,
                }
                break;
            }
            cursor = node.next.borrow().clone();
            prev = Some(node);
        }

        if let Some(fiber) = &listener.fiber {
            let mut waiting = fiber.waiting.borrow_mut();
            if let Some(handle) = waiting.take() {
                if !Rc::ptr_eq(&handle.listener, listener) {
                    *waiting = Some(handle);
                }
            }
        }

        let remaining = pollable
            .borrow()
            .head
            .borrow()
            .clone()
            .map(|_| recompute_mask(pollable))
            .unwrap_or_else(Interest::empty);
        pollable.borrow().mask.set(remaining);
    }

    /// Delivers `Write` then `Read` (in that order, matching the reference
    /// ordering guarantee) to every listener whose bit is set in `ready`,
    /// unlistening any whose machine reports [`StepResult::Done`].
    pub fn dispatch(pollable: &Rc<RefCell<Self>>, ready: Interest) {
        if ready.contains(Interest::WRITE) {
            Self::dispatch_bit(pollable, Interest::WRITE);
        }
        if ready.contains(Interest::READ) {
            Self::dispatch_bit(pollable, Interest::READ);
        }
    }

    fn dispatch_bit(pollable: &Rc<RefCell<Self>>, bit: Interest) {
        let mut cursor = pollable.borrow().head.borrow().clone();
        let mut finished = Vec::new();
        while let Some(node) = cursor {
            if node.mask.contains(bit) {
                let event = if bit == Interest::WRITE { MachineEvent::Write } else { MachineEvent::Read };
                let step = node.machine.borrow_mut().step(event, &pollable.borrow());
                if step == StepResult::Done {
                    finished.push(node.clone());
                }
                if let Some(fiber) = &node.fiber {
                    crate::runtime::Runtime::with(|rt| rt.schedule(fiber.clone()));
                }
            }
            cursor = node.next.borrow().clone();
        }
        for node in finished {
            Self::unlisten(pollable, &node);
        }
    }

    /// Marks the pollable closed, delivers `Close` to and unlistens every
    /// listener. Closing the underlying file descriptor is the caller's
    /// responsibility.
    pub fn close(pollable: &Rc<RefCell<Self>>) {
        pollable.borrow().closed.set(true);
        let fd = pollable.borrow().fd;
        let mut cursor = pollable.borrow().head.borrow().clone();
        let mut all = Vec::new();
        while let Some(node) = cursor {
            all.push(node.clone());
            cursor = node.next.borrow().clone();
        }
        for node in &all {
            node.machine.borrow_mut().step(MachineEvent::Close, &pollable.borrow());
        }
        for node in all {
            Self::unlisten(pollable, &node);
            crate::runtime::Runtime::with(|rt| rt.on_listener_removed(fd));
        }
    }

    /// Walks every listener's owning fiber, handing it to `visitor`. The
    /// realization of `janet_pollable_mark`/`janet_ev_mark` for an embedder
    /// layering a tracing collector on top of this crate.
    pub fn mark_reachable(pollable: &Rc<RefCell<Self>>, mut visitor: impl FnMut(&Rc<Task>)) {
        let mut cursor = pollable.borrow().head.borrow().clone();
        while let Some(node) = cursor {
            if let Some(fiber) = &node.fiber {
                visitor(fiber);
            }
            node.machine.borrow_mut().step(MachineEvent::Mark, &pollable.borrow());
            cursor = node.next.borrow().clone();
        }
    }
}

fn recompute_mask(pollable: &Rc<RefCell<Pollable>>) -> Interest {
    let mut mask = Interest::empty();
    let mut cursor = pollable.borrow().head.borrow().clone();
    while let Some(node) = cursor {
        mask |= node.mask & (Interest::READ | Interest::WRITE);
        cursor = node.next.borrow().clone();
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullMachine;
    impl Machine for NullMachine {
        fn step(&mut self, _event: MachineEvent, _pollable: &Pollable) -> StepResult {
            StepResult::NotDone
        }
    }

    #[test]
    fn duplicate_interest_is_rejected() {
        let p = Pollable::new(3);
        Pollable::listen(&p, Box::new(NullMachine), Interest::READ, None, true).unwrap();
        let err = Pollable::listen(&p, Box::new(NullMachine), Interest::READ, None, true)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateInterest));
    }

    #[test]
    fn disjoint_interest_is_allowed() {
        let p = Pollable::new(3);
        Pollable::listen(&p, Box::new(NullMachine), Interest::READ, None, true).unwrap();
        Pollable::listen(&p, Box::new(NullMachine), Interest::WRITE, None, true).unwrap();
        assert_eq!(p.borrow().mask(), Interest::READ | Interest::WRITE);
    }

    #[test]
    fn fiber_cannot_double_wait() {
        let p1 = Pollable::new(3);
        let p2 = Pollable::new(4);
        let task = Task::new(async {});
        Pollable::listen(&p1, Box::new(NullMachine), Interest::READ, Some(task.clone()), false)
            .unwrap();
        let err = Pollable::listen(&p2, Box::new(NullMachine), Interest::READ, Some(task), false)
            .unwrap_err();
        assert!(matches!(err, Error::FiberAlreadyWaiting));
    }

    #[test]
    fn unlisten_clears_mask() {
        let p = Pollable::new(3);
        let handle =
            Pollable::listen(&p, Box::new(NullMachine), Interest::READ, None, true).unwrap();
        handle.cancel();
        assert_eq!(p.borrow().mask(), Interest::empty());
    }
}
