//! A single-threaded cooperative event loop.
//!
//! This crate multiplexes user-level tasks ("fibers") over one OS thread
//! using Linux epoll for readiness, a min-heap for timed wakeups, a FIFO
//! ready-queue of runnable tasks, and bounded rendezvous channels for
//! inter-task communication.
//!
//! The loop is driven by [`runtime::Runtime::run`]; tasks are spawned with
//! [`fiber::spawn`] and talk to each other over [`channel::Channel`]s, or
//! synchronize with [`sync::Cond`]/[`sync::Latch`]. A task suspends itself
//! simply by `.await`-ing a leaf future that registers interest with the
//! reactor, the timeout heap, or a channel's waiter list; the loop resumes
//! it by polling its future again once that interest is satisfied.
//!
//! Everything here is `!Send`/`!Sync`: there is exactly one [`Runtime`] per
//! thread, held in thread-local storage, and no locking anywhere in the
//! crate.

pub mod channel;
pub mod clock;
pub mod error;
pub mod fiber;
pub mod heap;
pub mod pollable;
pub mod reactor;
pub mod ring;
pub mod runtime;
pub mod sync;
pub mod task;

pub use error::{Error, Result};
pub use runtime::Runtime;
