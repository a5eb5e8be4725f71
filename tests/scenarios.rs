//! End-to-end scenarios exercising the loop, channels, and cancellation
//! together rather than one module in isolation.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use fiberloop::channel::{self, Channel};
use fiberloop::fiber;
use fiberloop::pollable::{Interest, Machine, MachineEvent, StepResult};
use fiberloop::runtime::Runtime;

/// S1: two fibers sleeping for different durations resume in deadline
/// order, not spawn order.
#[test]
fn sleep_ordering() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let o_long = order.clone();
    let o_short = order.clone();

    let long = fiber::spawn(async move {
        fiber::sleep(Duration::from_millis(30)).await;
        o_long.borrow_mut().push("long");
    });
    let short = fiber::spawn(async move {
        fiber::sleep(Duration::from_millis(2)).await;
        o_short.borrow_mut().push("short");
    });

    short.join();
    long.join();
    assert_eq!(*order.borrow(), vec!["short", "long"]);
}

/// S2: a rendezvous (zero-capacity) channel hands a value directly from one
/// fiber to another with no buffering.
#[test]
fn rendezvous_handoff() {
    let (tx, rx) = channel::channel(0);
    let reader = fiber::spawn(async move { rx.recv().await });
    let writer = fiber::spawn(async move { tx.send("payload").await });
    writer.join().unwrap();
    assert_eq!(reader.join(), Some("payload"));
}

/// S3: a channel at capacity blocks additional writers until the reader
/// drains it, and resumes them in the order they were parked.
#[test]
fn bounded_backpressure() {
    let ch = Channel::new(1);
    let order = Rc::new(RefCell::new(Vec::new()));

    ch.try_give(0).unwrap();

    let c1 = ch.clone();
    let o1 = order.clone();
    let first_writer = fiber::spawn(async move {
        c1.give(1).await.unwrap();
        o1.borrow_mut().push(1);
    });
    let c2 = ch.clone();
    let o2 = order.clone();
    let second_writer = fiber::spawn(async move {
        c2.give(2).await.unwrap();
        o2.borrow_mut().push(2);
    });

    assert_eq!(ch.try_take().unwrap(), 0);
    assert_eq!(ch.try_take().unwrap(), 1);
    assert_eq!(ch.try_take().unwrap(), 2);

    first_writer.join();
    second_writer.join();
    assert_eq!(*order.borrow(), vec![1, 2]);
}

/// S4: cancelling a sleeping fiber drops its pending timeout and leaves it
/// suspended — not resumed, and un-resumable by the timer that used to be
/// armed for it.
#[test]
fn cancel_drops_pending_timeout() {
    let resumed = Rc::new(RefCell::new(false));
    let r = resumed.clone();
    let handle = fiber::spawn(async move {
        fiber::sleep(Duration::from_millis(50)).await;
        *r.borrow_mut() = true;
    });

    // Give the fiber a chance to reach its sleep and register the timeout.
    fiber::tick();

    fiber::cancel(&handle);

    // Pump the loop well past the original deadline; the cancelled fiber
    // must not resume, since its timeout was dropped by cancel() and
    // nothing else wakes it.
    for _ in 0..20 {
        fiber::tick();
    }
    assert!(!*resumed.borrow());

    std::mem::forget(handle);
}

struct ImmediateDone;
impl Machine for ImmediateDone {
    fn step(&mut self, _event: MachineEvent, _pollable: &fiberloop::pollable::Pollable) -> StepResult {
        StepResult::NotDone
    }
}

/// S5: registering a second listener for an interest a pollable is already
/// watching is rejected rather than silently accepted.
#[test]
fn duplicate_listen_is_rejected() {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let result = Runtime::with(|rt| {
        rt.listen(read_fd, Box::new(ImmediateDone), Interest::READ, None, true)
            .expect("first listen should succeed");
        rt.listen(read_fd, Box::new(ImmediateDone), Interest::READ, None, true)
    });
    assert!(result.is_err());

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// S6: every fiber reachable through a live listener is visited exactly
/// once by `mark_reachable`, the hook an embedding tracing collector would
/// use.
#[test]
fn mark_reachable_visits_every_parked_fiber() {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let task = fiberloop::task::Task::new(async {
        loop {
            fiber::yield_now().await;
        }
    });
    Runtime::with(|rt| {
        rt.listen(read_fd, Box::new(ImmediateDone), Interest::READ, Some(task.clone()), false)
            .unwrap();
    });

    let mut seen = 0;
    Runtime::with(|rt| {
        rt.mark_reachable(|_task| seen += 1);
    });
    assert_eq!(seen, 1);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}
