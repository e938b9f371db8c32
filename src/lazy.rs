//! Single-flight lazy initialization.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex},
    thread,
};

use crate::{
    context::{Context, TaskError},
    BoxError,
};

type Factory<T> = Box<dyn FnOnce(Context) -> Result<T, BoxError> + Send + 'static>;

/// A value computed by a fallible factory at most once.
///
/// The first call to [`LazyInit::wait`] starts the factory on its own thread;
/// every call — whether it arrives before, during, or long after the
/// computation — blocks until the result is available and returns a copy of
/// it. The factory never runs a second time, not even after it failed: the
/// computed result, success or error, is permanent.
///
/// The factory receives the context passed by the caller that triggered it.
/// Callers arriving once the computation is in flight cannot cancel or time
/// it out through their own contexts; they simply block until it finishes.
///
/// # Examples
///
/// ```
/// use regroup::{Context, LazyInit};
///
/// let init = LazyInit::new(|_ctx| Ok("expensive".to_string()));
///
/// let ctx = Context::background();
/// assert_eq!(init.wait(&ctx).unwrap(), "expensive");
/// assert_eq!(init.wait(&ctx).unwrap(), "expensive"); // cached
/// ```
pub struct LazyInit<T> {
    /// Taken by the first [`LazyInit::wait`] call; `None` means the factory
    /// is running or has finished.
    factory: Mutex<Option<Factory<T>>>,
    cell: Arc<Cell<T>>,
}

struct Cell<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

enum Slot<T> {
    Empty,
    Ready(Result<T, TaskError>),
    /// The factory panicked; the value will never arrive.
    Poisoned,
}

impl<T> Cell<T> {
    fn fulfill(&self, value: Slot<T>) {
        *self.slot.lock().unwrap() = value;
        self.condvar.notify_all();
    }

    fn read(&self) -> Result<T, TaskError>
    where
        T: Clone,
    {
        let mut slot = self.slot.lock().unwrap();
        loop {
            match &*slot {
                Slot::Empty => slot = self.condvar.wait(slot).unwrap(),
                Slot::Ready(result) => return result.clone(),
                Slot::Poisoned => panic!("lazy init factory panicked"),
            }
        }
    }
}

impl<T: Send + 'static> LazyInit<T> {
    /// Creates a lazy initializer from `factory`.
    ///
    /// Nothing runs until [`LazyInit::wait`] is called for the first time.
    pub fn new<F>(factory: F) -> LazyInit<T>
    where
        F: FnOnce(Context) -> Result<T, BoxError> + Send + 'static,
    {
        LazyInit {
            factory: Mutex::new(Some(Box::new(factory))),
            cell: Arc::new(Cell {
                slot: Mutex::new(Slot::Empty),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns the computed result, running the factory if this call is the
    /// first.
    ///
    /// Blocks until the result is available. All callers observe the same
    /// result; the value is handed out as a clone.
    ///
    /// # Panics
    ///
    /// Panics if the factory panicked.
    pub fn wait(&self, ctx: &Context) -> Result<T, TaskError>
    where
        T: Clone,
    {
        if let Some(factory) = self.factory.lock().unwrap().take() {
            let cell = self.cell.clone();
            let ctx = ctx.clone();
            // The factory thread is detached; its result reaches every
            // waiter through the cell instead of a join.
            let _ = thread::spawn(move || {
                log::trace!("running lazy init factory");
                match panic::catch_unwind(AssertUnwindSafe(|| {
                    factory(ctx).map_err(TaskError::new)
                })) {
                    Ok(result) => cell.fulfill(Slot::Ready(result)),
                    // The panic was already reported by the panic hook;
                    // poison the slot so waiters don't block forever.
                    Err(_) => cell.fulfill(Slot::Poisoned),
                }
            });
        }

        self.cell.read()
    }

    /// Returns the computed result if it is already available.
    ///
    /// Never blocks and never triggers the factory.
    ///
    /// # Panics
    ///
    /// Panics if the factory panicked.
    pub fn get(&self) -> Option<Result<T, TaskError>>
    where
        T: Clone,
    {
        match &*self.cell.slot.lock().unwrap() {
            Slot::Empty => None,
            Slot::Ready(result) => Some(result.clone()),
            Slot::Poisoned => panic!("lazy init factory panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::catch_unwind,
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use crate::context::Cancelled;

    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn factory_runs_once_for_concurrent_callers() {
        let runs = Arc::new(AtomicU32::new(0));
        let init = {
            let runs = runs.clone();
            LazyInit::new(move |_ctx| {
                runs.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                Ok(7)
            })
        };

        thread::scope(|s| {
            for _ in 0..100 {
                s.spawn(|| {
                    let ctx = Context::background();
                    assert_eq!(init.wait(&ctx).unwrap(), 7);
                });
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn result_is_cached() {
        let runs = Arc::new(AtomicU32::new(0));
        let init = {
            let runs = runs.clone();
            LazyInit::new(move |_ctx| Ok(runs.fetch_add(1, Ordering::SeqCst)))
        };

        let ctx = Context::background();
        assert!(init.get().is_none());
        assert_eq!(init.wait(&ctx).unwrap(), 0);
        assert_eq!(init.wait(&ctx).unwrap(), 0);
        assert_eq!(init.get().unwrap().unwrap(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_is_shared_with_every_caller() {
        let init = LazyInit::<u32>::new(|_ctx| Err("factory failed".into()));
        let ctx = Context::background();
        assert_eq!(init.wait(&ctx).unwrap_err().to_string(), "factory failed");
        // The factory is not retried after a failure.
        assert_eq!(init.wait(&ctx).unwrap_err().to_string(), "factory failed");
    }

    #[test]
    fn factory_observes_triggering_context() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let init = LazyInit::new(|ctx: Context| {
            if ctx.is_cancelled() {
                Err(Cancelled.into())
            } else {
                Ok(0)
            }
        });

        let err = init.wait(&ctx).unwrap_err();
        assert!(err.get_ref().is::<Cancelled>());

        // A later caller with a live context still sees the cached error.
        let live = Context::background();
        assert!(init.wait(&live).is_err());
    }

    #[test]
    fn panicking_factory_poisons_the_cell() {
        let init = LazyInit::<u32>::new(|_ctx| panic!("factory panic"));
        let ctx = Context::background();
        catch_unwind(AssertUnwindSafe(|| init.wait(&ctx))).unwrap_err();
    }

    #[test]
    fn lazy_init_is_send_and_sync() {
        assert_send::<LazyInit<u32>>();
        assert_sync::<LazyInit<u32>>();
    }
}
