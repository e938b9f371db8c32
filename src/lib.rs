//! Coordination primitives for fanning work out across threads: cancellable
//! task groups, the elastic worker pool they run on, and single-flight lazy
//! initialization.
//!
//! (if you're looking for homogeneous data parallelism with an iterator-like
//! interface, check out [`rayon`] instead; if you're coordinating thousands of
//! I/O-bound operations, you're probably better served by an `async` runtime)
//!
//! # Overview
//!
//! The central types are the fan-out groups. Each runs caller-supplied tasks
//! concurrently under one shared cancellation signal and keeps a single
//! outcome, and each embeds a [`TaskPool`] that grows to match the number of
//! concurrently running tasks and reuses its worker threads between
//! submissions:
//!
//! - [`ErrGroup`] — "all must succeed": the first task to return an error
//!   wins; its error cancels the shared [`Context`] and is returned by
//!   [`ErrGroup::wait`].
//! - [`RaceGroup`] — "first answer wins": the first task to complete at all,
//!   successfully or not, settles the outcome and cancels the rest.
//! - [`Group`] — the engine under both: fire-and-forget tasks sharing a
//!   cancellation signal, with exactly-once outcome capture exposed directly.
//!
//! Cancellation is cooperative. A [`Context`] only *carries* the signal (and
//! the error that caused it); tasks decide when to look, by polling
//! [`Context::is_cancelled`] or by blocking in [`Context::done`]. Tasks that
//! never look simply run to completion.
//!
//! Independent of the groups, [`LazyInit`] runs a fallible factory at most
//! once, no matter how many threads ask, and hands the identical result to
//! every one of them, forever.
//!
//! All of these types are rearming where that makes sense: a pool or group
//! that has been waited on is reset and ready for a new round of work, while
//! a [`LazyInit`] result is deliberately permanent.
//!
//! # Usage
//!
//! Fail-fast fan-out with [`ErrGroup`]:
//!
//! ```
//! use regroup::{Cancelled, ErrGroup};
//!
//! let group = ErrGroup::new();
//! for shard in 0..4 {
//!     group.go(move |ctx| {
//!         if shard == 2 {
//!             return Err(format!("shard {shard} is corrupt").into());
//!         }
//!         // Well-behaved tasks check for cancellation at convenient points.
//!         if ctx.is_cancelled() {
//!             return Err(Cancelled.into());
//!         }
//!         Ok(())
//!     });
//! }
//!
//! let err = group.wait().unwrap_err();
//! assert_eq!(err.to_string(), "shard 2 is corrupt");
//! ```
//!
//! Computing a value once, on demand, from many threads:
//!
//! ```
//! use std::thread;
//! use regroup::{Context, LazyInit};
//!
//! # fn measure_once() -> u32 { 4 }
//! let init = LazyInit::new(|_ctx| Ok(measure_once()));
//!
//! thread::scope(|s| {
//!     let a = s.spawn(|| init.wait(&Context::background()).unwrap());
//!     let b = s.spawn(|| init.wait(&Context::background()).unwrap());
//!     // The factory ran exactly once: both threads observe the same value.
//!     assert_eq!(a.join().unwrap(), b.join().unwrap());
//! });
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod context;
mod group;
mod lazy;
mod pool;

pub use crate::context::{CancelHandle, Cancelled, Context, TaskError};
pub use crate::group::{ErrGroup, Group, RaceGroup};
pub use crate::lazy::LazyInit;
pub use crate::pool::TaskPool;

/// The boxed error type returned by tasks and factories.
///
/// Captured errors are passed through unmodified: whatever a task returns is
/// what the corresponding `wait` call observes, shared via [`TaskError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
