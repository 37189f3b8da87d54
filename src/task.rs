//! The fundamental unit of work: [`Task`] and its force primitives.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{TaskError, TaskPoolError};
use crate::pool::{PoolInner, TaskPool, TaskPoolBuilder, DONE, NOT_STARTED};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Best-effort OS thread priority.
///
/// Setting or reading a priority never fails loudly when the platform
/// does not support it — this mirrors the source module's own
/// best-effort treatment of priority (see the `Open Questions` note on
/// priority handling in SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Applies this priority to the calling thread. A platform that
    /// cannot honor thread priorities simply ignores the request.
    pub(crate) fn apply_to_current_thread(self) {
        #[cfg(all(target_os = "linux", feature = "priority"))]
        {
            let nice = match self {
                Priority::Low => 10,
                Priority::Normal => 0,
                Priority::High => -10,
            };
            // SAFETY: setpriority with PRIO_PROCESS and tid 0 targets the
            // calling thread; failure is intentionally ignored per the
            // best-effort contract documented above.
            unsafe {
                libc::setpriority(libc::PRIO_PROCESS, 0, nice);
            }
        }
        #[cfg(not(all(target_os = "linux", feature = "priority")))]
        {
            let _ = self;
        }
    }
}

/// A unit of work submitted either to a [`TaskPool`] or run on a
/// dedicated OS thread, whose result is retrieved via one of the
/// `*_force` methods.
///
/// `Task` is the owned, heap-resident variant (spec.md's "task
/// factories returning an owned heap task"). The stack-resident,
/// destructor-blocking "scoped task" variant is expressed idiomatically
/// via [`TaskPool::scope`] instead — see `DESIGN.md` for the rationale.
pub struct Task<T> {
    pub(crate) inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task { inner: self.inner.clone() }
    }
}

pub(crate) struct TaskInner<T> {
    pub(crate) id: u64,
    pub(crate) status: Arc<AtomicU8>,
    result: Mutex<Option<Result<Arc<T>, TaskError>>>,
    pool: Mutex<Option<Arc<PoolInner>>>,
    body: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
}

impl<T: Send + 'static> Task<T> {
    /// Constructs a task bound to no pool yet. It must be submitted via
    /// [`TaskPool::submit`] or started via [`Task::run_in_new_thread`]
    /// before it can be forced.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Task {
            inner: Arc::new(TaskInner {
                id: next_task_id(),
                status: Arc::new(AtomicU8::new(NOT_STARTED)),
                result: Mutex::new(None),
                pool: Mutex::new(None),
                body: Mutex::new(Some(Box::new(f))),
            }),
        }
    }

    /// Spawns a dedicated single-thread, single-task pool holding only
    /// this task and starts it; returns immediately. Forwards `priority`
    /// to the new OS thread on a best-effort basis.
    pub fn run_in_new_thread(&self, priority: Option<Priority>) -> Result<(), TaskPoolError> {
        let mut builder = TaskPoolBuilder::new().num_threads(1).is_daemon(true);
        if let Some(p) = priority {
            builder = builder.thread_priority(p);
        }
        let pool = builder.build()?;
        submit_to(self, pool.inner.clone())?;
        // The dedicated pool's worker thread holds its own `Arc<PoolInner>`
        // clone, so dropping `pool` here does not tear anything down; it
        // simply releases this function's reference to it.
        Ok(())
    }

    /// Non-blocking: true if `Done` and no exception; false if not yet
    /// done; the captured exception is rethrown if the task finished
    /// with one.
    pub fn done(&self) -> Result<bool, TaskError> {
        if self.inner.status.load(Ordering::Acquire) != DONE {
            return Ok(false);
        }
        match &*self.inner.result.lock().unwrap() {
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(false),
        }
    }

    fn take_result(&self) -> Result<Arc<T>, TaskError> {
        // `status == Done` is observed with an acquire load before this
        // is ever called, which synchronizes with the release store the
        // executing job performs after writing `result` — see the two
        // force helpers below.
        match &*self.inner.result.lock().unwrap() {
            Some(r) => r.clone(),
            None => unreachable!("status is Done but result was not written"),
        }
    }

    /// Removes the result from storage and unwraps its `Arc`. Leaves
    /// `None` behind, so — unlike [`Self::take_result`] — this must
    /// only be called once per task; see [`Self::yield_force_owned`].
    fn take_owned_result(&self) -> Result<T, TaskError> {
        match self.inner.result.lock().unwrap().take() {
            Some(Ok(arc)) => Ok(Arc::into_inner(arc)
                .expect("task result Arc has more than one owner in take_owned_result")),
            Some(Err(e)) => Err(e),
            None => unreachable!("status is Done but result was not written"),
        }
    }

    /// If not yet started, steals the task out of its pool's queue and
    /// runs it on the calling thread. If already running elsewhere,
    /// busy-waits on the atomic status until `Done`.
    pub fn spin_force(&self) -> Result<Arc<T>, TaskError> {
        self.try_steal_and_run();
        while self.inner.status.load(Ordering::Acquire) != DONE {
            std::hint::spin_loop();
        }
        self.take_result()
    }

    /// Like [`Self::spin_force`], but waits on the pool's waiter
    /// condition variable instead of busy-spinning when the task is
    /// already running elsewhere.
    pub fn yield_force(&self) -> Result<Arc<T>, TaskError> {
        self.ensure_done_yield();
        self.take_result()
    }

    /// Like [`Self::yield_force`], but returns the owned `T` instead of
    /// an `Arc<T>` clone. Only sound when the caller holds the only
    /// `Task` handle and forces it exactly once — true of
    /// [`TaskPool::scope`]'s internal join and
    /// [`crate::iter::lazy::AsyncBuffer`]'s fill task, both of which own
    /// their `Task` privately and never call `done`/force it again.
    pub(crate) fn yield_force_owned(&self) -> Result<T, TaskError> {
        self.ensure_done_yield();
        self.take_owned_result()
    }

    /// Ensures the task has reached `Done`, stealing it or waiting as
    /// needed, without touching the stored result.
    fn ensure_done_yield(&self) {
        self.try_steal_and_run();
        if self.inner.status.load(Ordering::Acquire) == DONE {
            return;
        }
        let pool = self.pool_handle();
        let status = &self.inner.status;
        pool.wait_while(|| status.load(Ordering::Acquire) != DONE);
    }

    /// Like [`Self::spin_force`] for the not-yet-started case; if
    /// already running and the same pool has another task queued, pops
    /// and runs that other task instead of blocking, then re-checks this
    /// task. Falls back to [`Self::yield_force`] once the queue is
    /// empty. Exists to avoid deadlock when a task submitted from
    /// within another task would otherwise block a worker indefinitely.
    pub fn work_force(&self) -> Result<Arc<T>, TaskError> {
        if self.try_steal_and_run() {
            return self.take_result();
        }
        let pool = self.pool_handle();
        loop {
            if self.inner.status.load(Ordering::Acquire) == DONE {
                return self.take_result();
            }
            match pool.try_pop_any() {
                Some(job) => job(),
                None => break,
            }
        }
        self.yield_force()
    }

    fn pool_handle(&self) -> Arc<PoolInner> {
        self.inner.pool.lock().unwrap().clone().unwrap_or_else(|| {
            // A programming error (spec.md §7.1): panics rather than
            // returning a `Result`, per SPEC_FULL.md §10.1, but still
            // goes through the public error type so its variant and
            // message stay the single source of truth.
            panic!("{}", TaskPoolError::NotSubmitted)
        })
    }

    /// Attempts the steal-from-middle fast path: if this task is still
    /// `NotStarted`, removes it from its pool's queue and runs it
    /// inline. Returns `true` if it ran the task.
    fn try_steal_and_run(&self) -> bool {
        let pool = match self.inner.pool.lock().unwrap().clone() {
            Some(p) => p,
            None => return false,
        };
        match pool.steal(self.inner.id) {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

/// Submits an unbound task to `pool_inner`. Shared by [`TaskPool::spawn`],
/// [`TaskPool::submit`], [`Task::run_in_new_thread`], and
/// `Scope::spawn`.
pub(crate) fn submit_to<T: Send + 'static>(
    task: &Task<T>,
    pool_inner: Arc<PoolInner>,
) -> Result<(), TaskPoolError> {
    let mut pool_slot = task.inner.pool.lock().unwrap();
    if pool_slot.is_some() {
        return Err(TaskPoolError::AlreadySubmitted);
    }
    let body = task
        .inner
        .body
        .lock()
        .unwrap()
        .take()
        .ok_or(TaskPoolError::AlreadySubmitted)?;
    *pool_slot = Some(pool_inner.clone());
    drop(pool_slot);

    let status = task.inner.status.clone();
    let result_arc_holder = task.inner.clone();
    let pool_for_job = pool_inner.clone();

    let job: Box<dyn FnOnce() + Send> = Box::new(move || {
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(body))
            .map(Arc::new)
            .map_err(TaskError::from_panic);
        *result_arc_holder.result.lock().unwrap() = Some(outcome);
        status.store(DONE, Ordering::Release);
        pool_for_job.notify_finished();
    });

    pool_inner.enqueue(task.inner.id, task.inner.status.clone(), job);
    Ok(())
}

/// Builds and submits a task in one step, used by
/// [`TaskPool::spawn`] and `Scope::spawn`.
pub(crate) fn submit_new<T: Send + 'static>(
    pool: &TaskPool,
    f: Box<dyn FnOnce() -> T + Send>,
) -> Task<T> {
    let task = Task {
        inner: Arc::new(TaskInner {
            id: next_task_id(),
            status: Arc::new(AtomicU8::new(NOT_STARTED)),
            result: Mutex::new(None),
            pool: Mutex::new(None),
            body: Mutex::new(Some(f)),
        }),
    };
    submit_to(&task, pool.inner.clone()).expect("freshly constructed task cannot already be submitted");
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn future_promise_round_trip() {
        // Scenario 1: refFun(ref n) { n += 1 } starting from x = 0.
        let pool = TaskPool::new(2).unwrap();
        let x = Arc::new(AtomicI32::new(0));
        let x2 = x.clone();
        let task = pool.spawn(move || {
            x2.fetch_add(1, Ordering::SeqCst);
            x2.load(Ordering::SeqCst)
        });
        let result = task.yield_force().unwrap();
        assert_eq!(*result, 1);
        assert_eq!(x.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn done_reports_completion_and_reraises_panics() {
        let pool = TaskPool::new(1).unwrap();
        let ok_task = pool.spawn(|| 42);
        while !ok_task.done().unwrap() {
            std::thread::yield_now();
        }
        assert_eq!(ok_task.done().unwrap(), true);

        let bad_task = pool.spawn(|| -> i32 { panic!("boom") });
        loop {
            match bad_task.done() {
                Ok(false) => std::thread::yield_now(),
                Ok(true) => panic!("expected an error"),
                Err(e) => {
                    assert_eq!(e.message(), "boom");
                    break;
                }
            }
        }
        // Re-forcing must rethrow again.
        assert!(bad_task.done().is_err());
    }

    #[test]
    fn size_zero_pool_executes_synchronously_on_force() {
        let pool = TaskPool::new(0).unwrap();
        let task = pool.spawn(|| 7);
        assert_eq!(*task.spin_force().unwrap(), 7);
    }

    #[test]
    fn work_force_avoids_deadlock_on_single_worker_pool() {
        // Scenario 6: outer task submits an inner task and forces it.
        let pool = TaskPool::new(1).unwrap();
        let pool_for_outer = pool.clone();
        let outer = pool.spawn(move || {
            let inner = pool_for_outer.spawn(|| 5);
            *inner.work_force().unwrap() + 1
        });
        assert_eq!(*outer.yield_force().unwrap(), 6);
    }
}
