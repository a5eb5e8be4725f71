//! Bounded rendezvous channels.
//!
//! A [`Channel<T>`] is a fixed-capacity FIFO of `T` shared between fibers.
//! `give`/`take` block the calling fiber (by suspending it the same way any
//! other async operation in this crate does) when the channel is full or
//! empty respectively. A capacity of zero makes every `give` block until a
//! `take` is already waiting — a true rendezvous, exactly like the
//! reference implementation's zero-capacity channels.
//!
//! [`Sender`]/[`Receiver`] are a refcounted convenience layer on top of a
//! bare [`Channel`]: dropping the last handle on either side closes the
//! channel, waking every fiber still parked on it so it observes
//! disconnection instead of hanging forever.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::fiber;
use crate::ring::RingQueue;
use crate::runtime::Runtime;
use crate::task::{await_once, Task};

/// Error returned by a blocking [`Channel::give`] that found the channel
/// permanently closed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("channel is closed")]
pub struct SendError<T>(pub T);

/// Error returned by a blocking [`Channel::take`] that found the channel
/// permanently closed with nothing left to deliver.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("channel is closed")]
pub struct RecvError;

/// Error returned by [`Channel::try_give`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrySendError<T> {
    #[error("channel is full")]
    Full(T),
    #[error("channel is closed")]
    Closed(T),
}

/// Error returned by [`Channel::try_take`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("channel is closed")]
    Closed,
}

struct Inner<T> {
    items: RefCell<RingQueue<T>>,
    pending_readers: RefCell<RingQueue<Rc<Task>>>,
    pending_writers: RefCell<RingQueue<Rc<Task>>>,
    limit: usize,
    closed: Cell<bool>,
}

/// A bounded FIFO shared between fibers.
pub struct Channel<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

impl<T> Channel<T> {
    /// Creates a channel holding up to `limit` buffered items. `limit = 0`
    /// is a rendezvous channel: `give` only completes once a matching
    /// `take` is already parked waiting for it.
    pub fn new(limit: usize) -> Self {
        Channel {
            inner: Rc::new(Inner {
                items: RefCell::new(RingQueue::new()),
                pending_readers: RefCell::new(RingQueue::new()),
                pending_writers: RefCell::new(RingQueue::new()),
                limit,
                closed: Cell::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.limit
    }

    pub fn count(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn full(&self) -> bool {
        self.count() > self.inner.limit
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Pushes `value` onto the channel, suspending the calling fiber if the
    /// channel is already at capacity (or, for a rendezvous channel, until
    /// a reader is waiting). Fails if the channel is closed.
    pub async fn give(&self, value: T) -> Result<(), SendError<T>> {
        if self.inner.closed.get() {
            return Err(SendError(value));
        }
        if let Some(reader) = self.inner.pending_readers.borrow_mut().pop() {
            self.inner.items.borrow_mut().push(value).ok();
            Runtime::with(|rt| rt.schedule(reader));
            return Ok(());
        }
        self.inner.items.borrow_mut().push(value).ok();
        if self.over_capacity() {
            let current = fiber::current().expect("give() called outside of a running fiber");
            self.inner.pending_writers.borrow_mut().push(current).ok();
            await_once().await;
        }
        Ok(())
    }

    fn over_capacity(&self) -> bool {
        self.count() > self.inner.limit
    }

    /// Pops a value from the channel, suspending the calling fiber if it is
    /// empty. Resolves to `None` if the channel is closed and drained.
    pub async fn take(&self) -> Option<T> {
        loop {
            if let Some(value) = self.inner.items.borrow_mut().pop() {
                if let Some(writer) = self.inner.pending_writers.borrow_mut().pop() {
                    Runtime::with(|rt| rt.schedule(writer));
                }
                return Some(value);
            }
            if self.inner.closed.get() {
                return None;
            }
            let current = fiber::current().expect("take() called outside of a running fiber");
            self.inner.pending_readers.borrow_mut().push(current).ok();
            await_once().await;
        }
    }

    /// Non-blocking push: fails immediately instead of suspending.
    pub fn try_give(&self, value: T) -> Result<(), TrySendError<T>> {
        if self.inner.closed.get() {
            return Err(TrySendError::Closed(value));
        }
        if let Some(reader) = self.inner.pending_readers.borrow_mut().pop() {
            self.inner.items.borrow_mut().push(value).ok();
            Runtime::with(|rt| rt.schedule(reader));
            return Ok(());
        }
        if self.over_capacity_for(1) {
            return Err(TrySendError::Full(value));
        }
        self.inner.items.borrow_mut().push(value).ok();
        Ok(())
    }

    fn over_capacity_for(&self, additional: usize) -> bool {
        self.count() + additional > self.inner.limit
    }

    /// Non-blocking pop: fails immediately instead of suspending.
    pub fn try_take(&self) -> Result<T, TryRecvError> {
        if let Some(value) = self.inner.items.borrow_mut().pop() {
            if let Some(writer) = self.inner.pending_writers.borrow_mut().pop() {
                Runtime::with(|rt| rt.schedule(writer));
            }
            return Ok(value);
        }
        if self.inner.closed.get() {
            Err(TryRecvError::Closed)
        } else {
            Err(TryRecvError::Empty)
        }
    }

    /// Closes the channel: every pending and future `give` fails, and every
    /// pending and future `take` first drains whatever is still buffered
    /// before observing disconnection.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        while let Some(reader) = self.inner.pending_readers.borrow_mut().pop() {
            Runtime::with(|rt| rt.schedule(reader));
        }
        while let Some(writer) = self.inner.pending_writers.borrow_mut().pop() {
            Runtime::with(|rt| rt.schedule(writer));
        }
    }
}

/// The sending half of a [`Channel`], obtained via [`channel`].
///
/// Dropping the last `Sender` closes the channel, the same way the teacher
/// crate's own `fiber::channel::Sender` closes on last drop.
pub struct Sender<T> {
    channel: Channel<T>,
    count: Rc<Cell<usize>>,
}

/// The receiving half of a [`Channel`], obtained via [`channel`].
pub struct Receiver<T> {
    channel: Channel<T>,
    count: Rc<Cell<usize>>,
}

impl<T> Sender<T> {
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.channel.give(value).await
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.channel.try_give(value)
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl<T> Receiver<T> {
    pub async fn recv(&self) -> Option<T> {
        self.channel.take().await
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.channel.try_take()
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.count.set(self.count.get() + 1);
        Sender { channel: self.channel.clone(), count: self.count.clone() }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.count.set(self.count.get() + 1);
        Receiver { channel: self.channel.clone(), count: self.count.clone() }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
        if self.count.get() == 0 {
            self.channel.close();
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
        if self.count.get() == 0 {
            self.channel.close();
        }
    }
}

/// Creates a bounded channel and splits it into a refcounted
/// `Sender`/`Receiver` pair, either of which may be [`Clone`]d to give
/// multiple producers/consumers.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let ch = Channel::new(capacity);
    let tx_count = Rc::new(Cell::new(1));
    let rx_count = Rc::new(Cell::new(1));
    (
        Sender { channel: ch.clone(), count: tx_count },
        Receiver { channel: ch, count: rx_count },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_recv_same_fiber() {
        let ch = Channel::new(1);
        let handle = fiber::spawn(async move {
            ch.give(42).await.unwrap();
            ch.take().await
        });
        assert_eq!(handle.join(), Some(42));
    }

    #[test]
    fn rendezvous_blocks_until_reader_ready() {
        let (tx, rx) = channel(0);
        let reader = fiber::spawn(async move { rx.recv().await });
        let writer = fiber::spawn(async move { tx.send("hello").await.unwrap() });
        writer.join();
        assert_eq!(reader.join(), Some("hello"));
    }

    #[test]
    fn try_take_on_empty_fails_without_blocking() {
        let ch: Channel<()> = Channel::new(0);
        assert_eq!(ch.try_take().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn try_give_on_full_fails_without_blocking() {
        let ch = Channel::new(1);
        ch.try_give(1).unwrap();
        assert_eq!(ch.try_give(2).unwrap_err(), TrySendError::Full(2));
    }

    #[test]
    fn dropping_last_sender_closes_channel() {
        let (tx, rx) = channel::<()>(0);
        let reader = fiber::spawn(async move { rx.recv().await });
        drop(tx);
        assert_eq!(reader.join(), None);
    }

    #[test]
    fn bounded_backpressure_orders_writers() {
        let ch = Channel::new(1);
        let order = Rc::new(RefCell::new(Vec::new()));
        let ch1 = ch.clone();
        let ch2 = ch.clone();
        let o1 = order.clone();
        let o2 = order.clone();
        ch.try_give(0).unwrap();
        let w1 = fiber::spawn(async move {
            ch1.give(1).await.unwrap();
            o1.borrow_mut().push(1);
        });
        let w2 = fiber::spawn(async move {
            ch2.give(2).await.unwrap();
            o2.borrow_mut().push(2);
        });
        assert_eq!(ch.try_take().unwrap(), 0);
        assert_eq!(ch.try_take().unwrap(), 1);
        assert_eq!(ch.try_take().unwrap(), 2);
        w1.join();
        w2.join();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
