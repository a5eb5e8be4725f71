//! Crate-wide error type.
//!
//! Recoverable failures (duplicate interest registration, a fiber already
//! waiting, a channel hard-capacity overflow, a non-`EINTR` registration
//! failure) are represented by [`Error`] and returned from fallible calls.
//! An unexpected failure from the blocking reactor wait is not recoverable
//! and is handled outside `Result`: see [`abort_on_backend_failure`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot listen for duplicate event on pollable")]
    DuplicateInterest,

    #[error("current fiber is already waiting for an event")]
    FiberAlreadyWaiting,

    #[error("reactor registration failed: {0}")]
    Backend(#[from] io::Error),

    #[error("channel ring buffer overflowed (hard capacity exceeded)")]
    ChannelOverflow,
}

/// Logs and aborts the process.
///
/// Called when the reactor's blocking wait call fails with anything other
/// than `EINTR`. This is not surfaced as an `Error` variant: there is no
/// sensible recovery for a broken readiness back-end, and the reference
/// implementation treats this failure as fatal too.
pub fn abort_on_backend_failure(context: &str, err: io::Error) -> ! {
    log::error!("fatal reactor error during {context}: {err}");
    std::process::abort()
}
