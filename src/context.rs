//! Cooperative cancellation contexts.
//!
//! A [`Context`] carries a cancellation signal and, optionally, the error that
//! caused it. Contexts form a tree: [`Context::background`] returns the root,
//! which can never be cancelled, and [`Context::with_cancel`] derives a child
//! together with the [`CancelHandle`] that cancels it. Cancelling a context
//! also cancels every context derived from it, passing the cause along;
//! cancelling a child leaves its parent untouched.
//!
//! Cancellation is *cooperative*: nothing is interrupted or killed. Running
//! code has to observe the signal, either by polling
//! [`Context::is_cancelled`] at convenient points or by parking a thread in
//! [`Context::done`] until the signal arrives.
//!
//! # Examples
//!
//! ```
//! use regroup::Context;
//!
//! let (ctx, cancel) = Context::background().with_cancel();
//! assert!(!ctx.is_cancelled());
//!
//! cancel.cancel();
//! assert!(ctx.is_cancelled());
//! ctx.done(); // returns immediately
//! ```

use std::{
    error, fmt, mem,
    sync::{Arc, Condvar, Mutex, Weak},
    time::Duration,
};

use crate::BoxError;

/// A cloneable handle to an error reported by a task.
///
/// The same error has to be observable in several places at once: by the
/// caller collecting a group's outcome, and by every task inspecting the
/// cancellation cause of its [`Context`]. `TaskError` shares the original
/// error object between all of them; [`Display`][fmt::Display] and
/// [`source`][error::Error::source] delegate to it, and
/// [`TaskError::get_ref`] grants direct access for downcasting.
#[derive(Clone)]
pub struct TaskError(Arc<dyn error::Error + Send + Sync>);

impl TaskError {
    /// Wraps an error so that it can be shared across threads.
    pub fn new<E: Into<BoxError>>(err: E) -> Self {
        Self(Arc::from(err.into()))
    }

    /// Returns a reference to the error this handle was created from.
    pub fn get_ref(&self) -> &(dyn error::Error + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for TaskError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

/// The error conventionally returned by tasks that stop early because their
/// [`Context`] was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl error::Error for Cancelled {}

struct Shared {
    inner: Mutex<Inner>,
    /// Wakes threads parked in [`Context::done`].
    condvar: Condvar,
}

struct Inner {
    cancelled: bool,
    cause: Option<TaskError>,
    /// Contexts derived via [`Context::with_cancel`]; cancelled along with
    /// this one.
    // FIXME: dead children are only pruned when another child is derived; is
    // that enough for long-lived contexts?
    children: Vec<Weak<Shared>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            inner: Mutex::new(Inner {
                cancelled: false,
                cause: None,
                children: Vec::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    fn cancel(this: &Arc<Shared>, cause: Option<TaskError>) {
        let children;
        {
            let mut inner = this.inner.lock().unwrap();
            if inner.cancelled {
                // Only the first cancellation is recorded.
                return;
            }
            inner.cancelled = true;
            inner.cause = cause.clone();
            children = mem::take(&mut inner.children);
        }
        this.condvar.notify_all();

        for child in children {
            if let Some(child) = child.upgrade() {
                Shared::cancel(&child, cause.clone());
            }
        }
    }
}

/// A cancellation signal shared by a set of concurrent operations.
///
/// Cloning a `Context` is cheap and produces another observer of the *same*
/// signal; use [`Context::with_cancel`] to derive an independently cancellable
/// child instead.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl Context {
    /// Returns a root context that can never be cancelled.
    pub fn background() -> Context {
        Context {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Derives a child context that is cancelled through the returned
    /// [`CancelHandle`], or when `self` is cancelled (whichever happens
    /// first, carrying that cancellation's cause).
    ///
    /// If `self` is already cancelled, the child starts out cancelled.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let child = Arc::new(Shared::new());

        let mut inner = self.shared.inner.lock().unwrap();
        if inner.cancelled {
            let cause = inner.cause.clone();
            drop(inner);
            Shared::cancel(&child, cause);
        } else {
            inner.children.retain(|c| c.strong_count() != 0);
            inner.children.push(Arc::downgrade(&child));
        }

        (
            Context {
                shared: child.clone(),
            },
            CancelHandle { shared: child },
        )
    }

    /// Returns whether this context has been cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.inner.lock().unwrap().cancelled
    }

    /// Returns the error recorded as the reason for cancellation.
    ///
    /// This is [`None`] while the context is live, and also when the context
    /// was cancelled without a cause (via [`CancelHandle::cancel`]).
    pub fn cause(&self) -> Option<TaskError> {
        self.shared.inner.lock().unwrap().cause.clone()
    }

    /// Blocks the calling thread until this context is cancelled.
    ///
    /// Returns immediately if it already is. Note that the root context is
    /// never cancelled, so calling this on it blocks forever.
    pub fn done(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        while !inner.cancelled {
            inner = self.shared.condvar.wait(inner).unwrap();
        }
    }

    /// Blocks until this context is cancelled or `timeout` elapses.
    ///
    /// Returns `true` if the context was cancelled.
    pub fn done_timeout(&self, timeout: Duration) -> bool {
        let inner = self.shared.inner.lock().unwrap();
        let (inner, _) = self
            .shared
            .condvar
            .wait_timeout_while(inner, timeout, |inner| !inner.cancelled)
            .unwrap();
        inner.cancelled
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Context");
        match self.shared.inner.try_lock() {
            Ok(inner) => s.field("cancelled", &inner.cancelled),
            Err(_) => s.field("cancelled", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

/// Cancels the [`Context`] it was created alongside.
///
/// Created by [`Context::with_cancel`]. Cloning the handle yields another
/// handle to the same context; the context is cancelled by whichever handle
/// fires first.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Cancels the connected context without recording a cause.
    ///
    /// Only the first cancellation of a context has any effect; later calls
    /// are ignored.
    pub fn cancel(&self) {
        Shared::cancel(&self.shared, None);
    }

    /// Cancels the connected context, recording `cause` as the reason.
    pub fn cancel_with(&self, cause: TaskError) {
        Shared::cancel(&self.shared, Some(cause));
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn starts_live() {
        let (ctx, _cancel) = Context::background().with_cancel();
        assert!(!ctx.is_cancelled());
        assert!(ctx.cause().is_none());
        assert!(!ctx.done_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cancel_wakes_done() {
        let (ctx, cancel) = Context::background().with_cancel();
        let waiter = {
            let ctx = ctx.clone();
            thread::spawn(move || ctx.done())
        };
        cancel.cancel();
        waiter.join().unwrap();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn first_cancellation_wins() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel_with(TaskError::new("first"));
        cancel.cancel_with(TaskError::new("second"));
        assert_eq!(ctx.cause().unwrap().to_string(), "first");
    }

    #[test]
    fn cancel_without_cause() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cause().is_none());
    }

    #[test]
    fn child_inherits_parent_cancellation() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _child_cancel) = parent.with_cancel();
        cancel.cancel_with(TaskError::new("parent gave up"));
        assert!(child.is_cancelled());
        assert_eq!(child.cause().unwrap().to_string(), "parent gave up");
    }

    #[test]
    fn child_cancellation_leaves_parent_live() {
        let (parent, _cancel) = Context::background().with_cancel();
        let (child, child_cancel) = parent.with_cancel();
        child_cancel.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let (parent, cancel) = Context::background().with_cancel();
        cancel.cancel_with(TaskError::new("too late"));
        let (child, _child_cancel) = parent.with_cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.cause().unwrap().to_string(), "too late");
    }

    #[test]
    fn task_error_exposes_inner() {
        let err = TaskError::new(Cancelled);
        assert!(err.get_ref().is::<Cancelled>());
        assert_eq!(err.to_string(), Cancelled.to_string());
    }

    #[test]
    fn context_is_send_and_sync() {
        assert_send::<Context>();
        assert_sync::<Context>();
        assert_send::<CancelHandle>();
        assert_sync::<CancelHandle>();
        assert_send::<TaskError>();
        assert_sync::<TaskError>();
    }
}
