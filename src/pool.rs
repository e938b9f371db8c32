//! The elastic worker pool underlying the fan-out groups.

use std::{
    mem,
    panic::resume_unwind,
    sync::Mutex,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// An elastic pool of worker threads.
///
/// Each task submitted via [`TaskPool::go`] is handed directly to an idle
/// worker if one is ready to receive it; otherwise a new worker thread is
/// spawned. The pool therefore grows to match the peak number of concurrently
/// running tasks and never blocks the submitting thread, while repeated
/// submissions reuse the workers already running. Workers stay around until
/// [`TaskPool::wait`] drains the pool.
///
/// After [`TaskPool::wait`] returns, the pool is back in its initial state
/// and can be used for a new round of tasks. Submitting tasks concurrently
/// with a `wait` on the same pool is a usage error: such tasks race with the
/// drain and may end up in the next round.
///
/// The pool itself never reports task failures; fallible work communicates
/// its outcome through [`ErrGroup`][crate::ErrGroup],
/// [`RaceGroup`][crate::RaceGroup], or a side channel of its own. A task that
/// *panics* takes its worker thread down, and the panic is propagated to the
/// caller of [`TaskPool::wait`].
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use regroup::TaskPool;
///
/// let pool = TaskPool::new();
/// let counter = Arc::new(AtomicU32::new(0));
/// for _ in 0..10 {
///     let counter = counter.clone();
///     pool.go(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     });
/// }
/// pool.wait();
/// assert_eq!(counter.load(Ordering::SeqCst), 10);
/// ```
pub struct TaskPool {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Handoff channel, created when the first task of a round is submitted.
    ///
    /// The channel has no capacity: a send succeeds only while an idle worker
    /// is blocking on the receiving side.
    channel: Option<(Sender<Task>, Receiver<Task>)>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Creates an empty pool with no worker threads.
    pub fn new() -> TaskPool {
        TaskPool {
            inner: Mutex::new(Inner {
                channel: None,
                workers: Vec::new(),
            }),
        }
    }

    /// Submits a task for concurrent execution.
    ///
    /// If a worker is currently idle, it picks the task up immediately.
    /// Otherwise a new worker thread is spawned; the new worker runs `task`
    /// and then keeps serving further submissions until the pool is drained.
    pub fn go<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        let mut inner = self.inner.lock().unwrap();
        if inner.channel.is_none() {
            inner.channel = Some(crossbeam_channel::bounded(0));
        }

        let rejected = {
            let (sender, _) = inner.channel.as_ref().unwrap();
            match sender.try_send(task) {
                Ok(()) => None,
                Err(TrySendError::Full(task)) => Some(task),
                Err(TrySendError::Disconnected(_)) => {
                    // We hold the only sender until `wait` takes it.
                    unreachable!("handoff channel disconnected while in use")
                }
            }
        };

        if let Some(task) = rejected {
            // No worker was ready to take the handoff; grow the pool.
            let receiver = inner.channel.as_ref().unwrap().1.clone();
            let n = inner.workers.len();
            log::trace!("no idle worker, spawning worker #{n}");
            let handle = thread::spawn(move || {
                task();
                for task in receiver {
                    task();
                }
                log::trace!("worker #{n} exiting");
            });
            inner.workers.push(handle);
        }
    }

    /// Blocks until every submitted task has finished, then resets the pool.
    ///
    /// Closing the handoff channel signals all workers to finish their
    /// current task and exit; `wait` then joins every worker thread. Calling
    /// this on a pool with no submitted tasks returns immediately.
    ///
    /// If a task panicked, the panic is propagated to the caller once all
    /// workers have been joined.
    pub fn wait(&self) {
        let (channel, workers) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.channel.take(), mem::take(&mut inner.workers))
        };
        // Dropping the sender closes the channel, so idle workers run out of
        // tasks and exit their loop.
        drop(channel);

        let mut payload = None;
        for handle in workers {
            if let Err(pl) = handle.join() {
                payload = Some(pl);
            }
        }
        if let Some(payload) = payload {
            if !thread::panicking() {
                resume_unwind(payload);
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> TaskPool {
        TaskPool::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc, Barrier,
        },
        time::Duration,
    };

    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    fn silent_panic(payload: String) {
        resume_unwind(Box::new(payload));
    }

    fn run_tasks(pool: &TaskPool, tasks: u32, delay: Duration) -> u32 {
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..tasks {
            let counter = counter.clone();
            pool.go(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait();
        counter.load(Ordering::SeqCst)
    }

    #[test]
    fn runs_all_tasks() {
        let pool = TaskPool::new();
        assert_eq!(run_tasks(&pool, 8, Duration::from_millis(5)), 8);
    }

    #[test]
    fn handles_many_tasks() {
        let pool = TaskPool::new();
        assert_eq!(run_tasks(&pool, 50, Duration::ZERO), 50);
    }

    #[test]
    fn reusable_after_wait() {
        let pool = TaskPool::new();
        assert_eq!(run_tasks(&pool, 8, Duration::ZERO), 8);
        assert_eq!(run_tasks(&pool, 5, Duration::ZERO), 5);
    }

    #[test]
    fn wait_without_tasks_is_a_noop() {
        let pool = TaskPool::new();
        pool.wait();
        pool.wait();
    }

    #[test]
    fn grows_while_tasks_block() {
        // All 4 tasks rendezvous on the barrier, so they can only finish if
        // the pool runs them on 4 concurrent workers.
        let pool = TaskPool::new();
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..4 {
            let barrier = barrier.clone();
            pool.go(move || {
                barrier.wait();
            });
        }
        pool.wait();
    }

    #[test]
    fn concurrent_submitters() {
        let pool = TaskPool::new();
        let counter = Arc::new(AtomicU32::new(0));
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..25 {
                        let counter = counter.clone();
                        pool.go(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                });
            }
        });
        pool.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn wait_propagates_task_panic() {
        let pool = TaskPool::new();
        pool.go(|| silent_panic("task panic".into()));
        catch_unwind(AssertUnwindSafe(|| pool.wait())).unwrap_err();

        // The pool is reset and usable again afterwards.
        assert_eq!(run_tasks(&pool, 3, Duration::ZERO), 3);
    }

    #[test]
    fn pool_is_send_and_sync() {
        assert_send::<TaskPool>();
        assert_sync::<TaskPool>();
    }
}
