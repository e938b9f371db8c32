//! Cancellable fan-out groups.
//!
//! All three group flavors run their tasks on an embedded [`TaskPool`] and
//! share one cancellable [`Context`] per round of work. They differ only in
//! which task completions they keep:
//!
//! - [`Group`] keeps whatever is reported to [`Group::capture`] first — or
//!   nothing at all, for plain fire-and-forget tasks that merely share the
//!   cancellation signal.
//! - [`ErrGroup`] keeps the first *error*; successes are discarded.
//! - [`RaceGroup`] keeps the first *completion*, success or failure.
//!
//! In every case the kept outcome cancels the shared context, asking the
//! remaining tasks to stop early. Cancellation is cooperative: a task that
//! never looks at its context simply runs to completion, and its outcome is
//! discarded.

use std::sync::{Arc, Mutex};

use crate::{
    context::{CancelHandle, Context, TaskError},
    pool::TaskPool,
    BoxError,
};

/// The coordinator shared by the fan-out groups.
///
/// A `Group` owns a [`TaskPool`] and lazily derives a cancellable [`Context`]
/// that is shared by every task of the current round. The first outcome
/// reported via [`Group::capture`] becomes the round's result and cancels
/// the shared context; everything reported afterwards is discarded.
///
/// [`ErrGroup`] and [`RaceGroup`] build their policies on top of this type.
/// Use it directly for fire-and-forget tasks that only need the shared
/// cancellation signal.
///
/// [`Group::wait`] drains the pool and rearms the group: the next round
/// derives a fresh context and captures a fresh outcome. Like the pool, a
/// group must not be submitted to concurrently with a `wait` on it, and is
/// shared by reference or [`Arc`], never by value.
pub struct Group {
    pool: TaskPool,
    state: Mutex<State>,
}

struct State {
    /// Context supplied through [`Group::set_context`]; round contexts are
    /// derived from it.
    base: Option<Context>,
    /// The current round's shared context and its cancel handle.
    round: Option<(Context, CancelHandle)>,
    /// The captured outcome. `Some` once a task has won the capture race.
    outcome: Option<Result<(), TaskError>>,
}

impl State {
    fn context(&mut self) -> Context {
        if self.round.is_none() {
            let base = self.base.clone().unwrap_or_else(Context::background);
            self.round = Some(base.with_cancel());
        }
        self.round.as_ref().unwrap().0.clone()
    }
}

impl Group {
    /// Creates an empty group.
    pub fn new() -> Group {
        Group {
            pool: TaskPool::new(),
            state: Mutex::new(State {
                base: None,
                round: None,
                outcome: None,
            }),
        }
    }

    /// Replaces the context that round contexts are derived from.
    ///
    /// Cancelling `ctx` then cancels every subsequent round. This must be
    /// called before the first task of a round is submitted; a round that has
    /// already started keeps the context it was started with.
    pub fn set_context(&self, ctx: Context) {
        self.state.lock().unwrap().base = Some(ctx);
    }

    /// Returns the current round's shared context, deriving it if necessary.
    pub fn context(&self) -> Context {
        self.state.lock().unwrap().context()
    }

    /// Submits a task for concurrent execution under the group's context.
    pub fn go<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Materialize the round context up front, so every task of the round
        // observes the same cancellation signal no matter when it looks.
        self.state.lock().unwrap().context();
        self.pool.go(task);
    }

    /// Cancels the current round's context without recording a cause.
    pub fn cancel(&self) {
        let handle = self.cancel_handle();
        handle.cancel();
    }

    /// Cancels the current round's context, recording `cause` as the reason.
    pub fn cancel_with(&self, cause: TaskError) {
        let handle = self.cancel_handle();
        handle.cancel_with(cause);
    }

    fn cancel_handle(&self) -> CancelHandle {
        let mut state = self.state.lock().unwrap();
        state.context();
        state.round.as_ref().unwrap().1.clone()
    }

    /// Reports a task outcome, keeping it only if it is the round's first.
    ///
    /// The winner is the first caller to acquire the capture slot, not the
    /// first to finish in wall-clock time if the acquisitions race. Capturing
    /// cancels the round's shared context, recording the error as the
    /// cancellation cause when the outcome is one. Later calls are silently
    /// discarded.
    pub fn capture(&self, outcome: Result<(), BoxError>) {
        let mut state = self.state.lock().unwrap();
        if state.outcome.is_some() {
            return;
        }
        state.context();

        let outcome = outcome.map_err(TaskError::new);
        let (_, handle) = state.round.as_ref().unwrap();
        match &outcome {
            Ok(()) => {
                log::trace!("captured first outcome (success), cancelling round");
                handle.cancel();
            }
            Err(err) => {
                log::trace!("captured first outcome (error: {err}), cancelling round");
                handle.cancel_with(err.clone());
            }
        }
        state.outcome = Some(outcome);
    }

    /// Blocks until the pool drains, then returns the captured outcome.
    ///
    /// Returns `Ok` if nothing was captured. Afterwards the group is rearmed:
    /// the next round derives a fresh context and captures a fresh outcome.
    pub fn wait(&self) -> Result<(), TaskError> {
        self.pool.wait();

        let mut state = self.state.lock().unwrap();
        state.round = None;
        state.outcome.take().unwrap_or(Ok(()))
    }
}

impl Default for Group {
    fn default() -> Group {
        Group::new()
    }
}

/// Runs fallible, context-aware tasks concurrently; the first error wins.
///
/// Every task receives the group's shared [`Context`]. The first task to
/// return an error has that error captured and the context cancelled, asking
/// its siblings to stop early; tasks that return `Ok` neither cancel anything
/// nor overwrite a captured error. Errors after the first are silently
/// dropped, not aggregated.
///
/// # Examples
///
/// ```
/// use regroup::{Cancelled, ErrGroup};
///
/// let group = ErrGroup::new();
/// group.go(|_ctx| Err("disk on fire".into()));
/// group.go(|ctx| {
///     // Parked until the failure above cancels the shared context.
///     ctx.done();
///     Err(Cancelled.into())
/// });
///
/// let err = group.wait().unwrap_err();
/// assert_eq!(err.to_string(), "disk on fire");
/// ```
pub struct ErrGroup {
    group: Arc<Group>,
}

impl ErrGroup {
    /// Creates an empty group.
    pub fn new() -> ErrGroup {
        ErrGroup {
            group: Arc::new(Group::new()),
        }
    }

    /// Derives the group's round contexts from `ctx` instead of the root
    /// context, so that cancelling `ctx` cancels the group's tasks.
    pub fn with_context(self, ctx: Context) -> ErrGroup {
        self.group.set_context(ctx);
        self
    }

    /// Returns the current round's shared context.
    pub fn context(&self) -> Context {
        self.group.context()
    }

    /// Submits a fallible task for concurrent execution.
    ///
    /// If `task` returns an error and no sibling has failed before it, that
    /// error becomes the group's result and the shared context is cancelled.
    pub fn go<F>(&self, task: F)
    where
        F: FnOnce(Context) -> Result<(), BoxError> + Send + 'static,
    {
        let group = self.group.clone();
        let ctx = self.group.context();
        self.group.go(move || {
            if let Err(err) = task(ctx) {
                group.capture(Err(err));
            }
        });
    }

    /// Blocks until every submitted task has finished, then returns the
    /// first captured error, or `Ok` if every task succeeded.
    pub fn wait(&self) -> Result<(), TaskError> {
        self.group.wait()
    }
}

impl Default for ErrGroup {
    fn default() -> ErrGroup {
        ErrGroup::new()
    }
}

/// Runs fallible, context-aware tasks concurrently; the first *completion*
/// wins, success or failure.
///
/// The winning task's outcome — `Ok` or an error — becomes the group's
/// result, and the shared [`Context`] is cancelled either way, asking the
/// losing tasks to stop early. Outcomes of the losers are discarded, even
/// when the winner failed and a loser would have succeeded.
///
/// This models "first answer wins" semantics, such as querying redundant
/// sources and taking whichever responds first, whereas [`ErrGroup`] models
/// "all must succeed, stop early on the first failure".
///
/// # Examples
///
/// ```
/// use regroup::{Cancelled, RaceGroup};
///
/// let group = RaceGroup::new();
/// group.go(|_ctx| Ok(())); // the winner
/// group.go(|ctx| {
///     ctx.done();
///     Err(Cancelled.into()) // discarded
/// });
///
/// assert!(group.wait().is_ok());
/// ```
pub struct RaceGroup {
    group: Arc<Group>,
}

impl RaceGroup {
    /// Creates an empty group.
    pub fn new() -> RaceGroup {
        RaceGroup {
            group: Arc::new(Group::new()),
        }
    }

    /// Derives the group's round contexts from `ctx` instead of the root
    /// context, so that cancelling `ctx` cancels the group's tasks.
    pub fn with_context(self, ctx: Context) -> RaceGroup {
        self.group.set_context(ctx);
        self
    }

    /// Returns the current round's shared context.
    pub fn context(&self) -> Context {
        self.group.context()
    }

    /// Submits a fallible task for the race.
    ///
    /// The first task to complete at all has its outcome captured and the
    /// shared context cancelled.
    pub fn go<F>(&self, task: F)
    where
        F: FnOnce(Context) -> Result<(), BoxError> + Send + 'static,
    {
        let group = self.group.clone();
        let ctx = self.group.context();
        self.group.go(move || {
            group.capture(task(ctx));
        });
    }

    /// Blocks until every submitted task has finished, then returns the
    /// winner's outcome.
    pub fn wait(&self) -> Result<(), TaskError> {
        self.group.wait()
    }
}

impl Default for RaceGroup {
    fn default() -> RaceGroup {
        RaceGroup::new()
    }
}
