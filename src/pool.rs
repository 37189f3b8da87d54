//! The task queue, worker threads, and pool lifecycle.

use std::cell::Cell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::error::TaskPoolError;
use crate::task::{self, Priority, Task};

pub(crate) const NOT_STARTED: u8 = 0;
pub(crate) const IN_PROGRESS: u8 = 1;
pub(crate) const DONE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Finishing,
    StopNow,
}

type Job = Box<dyn FnOnce() + Send>;

struct QueueEntry {
    id: u64,
    status: Arc<AtomicU8>,
    job: Job,
}

struct QueueState {
    queue: VecDeque<QueueEntry>,
    lifecycle: Lifecycle,
}

/// The shared, reference-counted guts of a [`TaskPool`]: the queue, the
/// two condition variables, and the lifecycle state. `TaskPool` is a
/// thin `Arc<PoolInner>` handle so cloning a pool is cheap and every
/// clone (including the ones captured by worker closures and by
/// submitted tasks' back-references) observes the same queue.
pub(crate) struct PoolInner {
    queue: Mutex<QueueState>,
    /// Notified whenever a task is enqueued or the lifecycle state
    /// changes — workers block on this while the queue is empty.
    work_available: Condvar,
    waiter_mutex: Mutex<()>,
    /// Notified whenever any task transitions to `Done`.
    task_finished: Condvar,
    n_workers: usize,
    pool_id: usize,
    is_daemon: bool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    pub(crate) fn enqueue(&self, id: u64, status: Arc<AtomicU8>, job: Job) {
        {
            let mut qs = self.queue.lock().unwrap();
            qs.queue.push_back(QueueEntry { id, status, job });
        }
        self.work_available.notify_one();
    }

    /// Steal-from-middle (spec.md §4.4): if the task is still
    /// `NotStarted`, unlinks it from the queue and returns its job so
    /// the caller can run it inline.
    pub(crate) fn steal(&self, id: u64) -> Option<Job> {
        let mut qs = self.queue.lock().unwrap();
        let pos = qs.queue.iter().position(|e| e.id == id)?;
        let entry = qs.queue.remove(pos)?;
        // Anything still physically in the queue is NotStarted by
        // construction (workers only ever remove from the front under
        // this same mutex), but we still verify the transition rather
        // than assume it.
        entry
            .status
            .compare_exchange(NOT_STARTED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(entry.job)
    }

    /// Pops any one queued job (used by `work_force` to make forward
    /// progress instead of blocking). Non-blocking.
    pub(crate) fn try_pop_any(&self) -> Option<Job> {
        let mut qs = self.queue.lock().unwrap();
        let entry = qs.queue.pop_front()?;
        entry.status.store(IN_PROGRESS, Ordering::Release);
        Some(entry.job)
    }

    pub(crate) fn notify_finished(&self) {
        let _guard = self.waiter_mutex.lock().unwrap();
        self.task_finished.notify_all();
    }

    /// Blocks the calling thread on the task-finished condition
    /// variable until `keep_waiting` returns false.
    pub(crate) fn wait_while(&self, mut keep_waiting: impl FnMut() -> bool) {
        let guard = self.waiter_mutex.lock().unwrap();
        let _guard = self
            .task_finished
            .wait_while(guard, |_| keep_waiting())
            .unwrap();
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.n_workers
    }

    pub(crate) fn pool_id(&self) -> usize {
        self.pool_id
    }
}

fn worker_loop(pool: Arc<PoolInner>, local_index: usize) {
    CURRENT_WORKER.with(|c| c.set(Some((pool.pool_id, local_index))));
    loop {
        let job = {
            let mut qs = pool.queue.lock().unwrap();
            loop {
                if let Some(entry) = qs.queue.pop_front() {
                    entry.status.store(IN_PROGRESS, Ordering::Release);
                    break Some(entry.job);
                }
                match qs.lifecycle {
                    Lifecycle::Running => {
                        qs = pool.work_available.wait(qs).unwrap();
                    }
                    Lifecycle::Finishing => {
                        qs.lifecycle = Lifecycle::StopNow;
                        break None;
                    }
                    Lifecycle::StopNow => break None,
                }
            }
        };
        match job {
            Some(job) => {
                // Job closures already catch their own body's panics
                // (see `task::submit_to`); this guard only protects the
                // worker loop itself against a job closure bug.
                let _ = std::panic::catch_unwind(AssertUnwindSafe(job));
            }
            None => return,
        }
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Returns 1-based worker slot index for the calling thread within
/// `pool_id`, or `0` if the calling thread is not one of that pool's
/// workers (the shared slot for all non-worker threads, per spec.md
/// §3's `WorkerLocalStorage`).
pub(crate) fn current_worker_slot(pool_id: usize) -> usize {
    CURRENT_WORKER.with(|c| match c.get() {
        Some((pid, idx)) if pid == pool_id => idx,
        _ => 0,
    })
}

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Builder for [`TaskPool`], mirroring `bevy_tasks::TaskPoolBuilder`.
#[derive(Debug, Clone)]
pub struct TaskPoolBuilder {
    num_threads: Option<usize>,
    thread_name: Option<String>,
    is_daemon: bool,
    thread_priority: Option<Priority>,
}

impl Default for TaskPoolBuilder {
    fn default() -> Self {
        TaskPoolBuilder {
            num_threads: None,
            thread_name: None,
            is_daemon: false,
            thread_priority: None,
        }
    }
}

impl TaskPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads. `0` is legal and degrades every
    /// submission to synchronous execution on force.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn thread_name(mut self, name: String) -> Self {
        self.thread_name = Some(name);
        self
    }

    /// Whether worker threads are allowed to keep running detached
    /// once the `TaskPool` handle is dropped. Defaults to `true` for
    /// the process-global pool and `false` for user-constructed pools.
    pub fn is_daemon(mut self, is_daemon: bool) -> Self {
        self.is_daemon = is_daemon;
        self
    }

    pub fn thread_priority(mut self, priority: Priority) -> Self {
        self.thread_priority = Some(priority);
        self
    }

    pub fn build(self) -> Result<TaskPool, TaskPoolError> {
        let n_workers = self.num_threads.unwrap_or_else(default_pool_threads);
        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(QueueState {
                queue: VecDeque::new(),
                lifecycle: Lifecycle::Running,
            }),
            work_available: Condvar::new(),
            waiter_mutex: Mutex::new(()),
            task_finished: Condvar::new(),
            n_workers,
            pool_id,
            is_daemon: self.is_daemon,
            worker_handles: Mutex::new(Vec::with_capacity(n_workers)),
        });

        let mut handles = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let worker_pool = inner.clone();
            let priority = self.thread_priority;
            let mut builder = std::thread::Builder::new();
            if let Some(name) = &self.thread_name {
                builder = builder.name(format!("{name}-{i}"));
            }
            let handle = builder
                .spawn(move || {
                    if let Some(p) = priority {
                        p.apply_to_current_thread();
                    }
                    worker_loop(worker_pool, i + 1);
                })
                .map_err(TaskPoolError::WorkerSpawn)?;
            handles.push(handle);
        }
        *inner.worker_handles.lock().unwrap() = handles;

        #[cfg(feature = "trace")]
        tracing::debug!(pool_id, n_workers, "pool_new");

        Ok(TaskPool { inner })
    }
}

/// A reusable pool of worker threads executing [`Task`]s submitted via
/// [`TaskPool::spawn`]/[`TaskPool::submit`] or implicitly by the
/// `iter` module's data-parallel combinators.
///
/// Cloning a `TaskPool` is cheap (it is an `Arc` handle); every clone
/// refers to the same queue and workers.
pub struct TaskPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Clone for TaskPool {
    fn clone(&self) -> Self {
        TaskPool { inner: self.inner.clone() }
    }
}

impl TaskPool {
    /// Convenience for `TaskPoolBuilder::new().num_threads(n).build()`.
    pub fn new(num_threads: usize) -> Result<Self, TaskPoolError> {
        TaskPoolBuilder::new().num_threads(num_threads).build()
    }

    pub fn builder() -> TaskPoolBuilder {
        TaskPoolBuilder::new()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.thread_count()
    }

    pub(crate) fn pool_id(&self) -> usize {
        self.inner.pool_id()
    }

    /// Spawns `f` as a new, owned [`Task`] and enqueues it.
    pub fn spawn<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        task::submit_new(self, Box::new(f))
    }

    /// Submits a task constructed with [`Task::new`] that has not yet
    /// been bound to a pool. Fails with
    /// [`TaskPoolError::AlreadySubmitted`] if it already has been.
    pub fn submit<T: Send + 'static>(&self, t: &Task<T>) -> Result<(), TaskPoolError> {
        task::submit_to(t, self.inner.clone())
    }

    /// Graceful shutdown: the queue drains and workers exit once empty.
    /// Non-blocking.
    pub fn finish(&self) {
        {
            let mut qs = self.inner.queue.lock().unwrap();
            qs.lifecycle = Lifecycle::Finishing;
        }
        self.inner.work_available.notify_all();
        #[cfg(feature = "trace")]
        tracing::debug!(pool_id = self.inner.pool_id, "pool_finish");
    }

    /// Coarse, pool-wide cancellation: in-flight tasks finish, queued
    /// tasks are abandoned. Forces on abandoned tasks fall back to
    /// running on the calling thread via the steal-from-middle path
    /// (they remain `NotStarted` in memory even though the worker
    /// loop has stopped servicing the queue).
    pub fn stop(&self) {
        let abandoned = {
            let mut qs = self.inner.queue.lock().unwrap();
            qs.lifecycle = Lifecycle::StopNow;
            qs.queue.len()
        };
        self.inner.work_available.notify_all();
        if abandoned > 0 {
            #[cfg(feature = "trace")]
            tracing::warn!(pool_id = self.inner.pool_id, abandoned, "pool_stop abandoned queued tasks");
        }
    }

    /// Allows spawning non-`'static` tasks that borrow from the calling
    /// stack frame. This is the idiomatic-Rust replacement for
    /// spec.md's destructor-blocking "scoped task": the borrow checker
    /// (rather than a `Drop` impl) prevents the borrowed data from
    /// being dropped before every spawned task completes, because
    /// `scope` does not return until it has forced every one of them.
    pub fn scope<'env, F, T>(&self, f: F) -> Vec<T>
    where
        F: for<'scope> FnOnce(&Scope<'scope, 'env, T>),
        T: Send + 'static,
    {
        let scope = Scope {
            pool: self,
            handles: std::cell::RefCell::new(Vec::new()),
            _scope: PhantomData,
            _env: PhantomData,
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f(&scope)));
        let handles = scope.handles.into_inner();
        let outputs: Vec<T> = handles
            .into_iter()
            .map(|t| match t.yield_force_owned() {
                Ok(value) => value,
                Err(e) => std::panic::resume_unwind(Box::new(e)),
            })
            .collect();
        if let Err(payload) = outcome {
            std::panic::resume_unwind(payload);
        }
        outputs
    }
}

/// A `TaskPool` scope for running one or more non-`'static` tasks; see
/// [`TaskPool::scope`].
pub struct Scope<'scope, 'env: 'scope, T: Send + 'static> {
    pool: &'scope TaskPool,
    handles: std::cell::RefCell<Vec<Task<T>>>,
    _scope: PhantomData<&'scope mut &'scope ()>,
    _env: PhantomData<&'env mut &'env ()>,
}

impl<'scope, 'env, T: Send + 'static> Scope<'scope, 'env, T> {
    /// Spawns a scoped task. `f` may borrow anything that outlives the
    /// scope; the scope guarantees `f` has returned before
    /// [`TaskPool::scope`] returns.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() -> T + Send + 'scope,
    {
        let boxed: Box<dyn FnOnce() -> T + Send + 'scope> = Box::new(f);
        // SAFETY: `TaskPool::scope` forces every task spawned here
        // (via the `yield_force` join loop) before it returns, so no
        // data borrowed for strictly less than `'scope` can be freed
        // while this closure might still run. This mirrors the same
        // lifetime-extension technique (and justification) used by
        // `bevy_tasks`'s single-threaded `Scope::spawn_on_scope`.
        let boxed: Box<dyn FnOnce() -> T + Send + 'static> =
            unsafe { std::mem::transmute(boxed) };
        let task = task::submit_new(self.pool, boxed);
        self.handles.borrow_mut().push(task);
    }
}

impl std::fmt::Debug for TaskPoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPoolBuilder")
            .field("num_threads", &self.num_threads)
            .field("is_daemon", &self.is_daemon)
            .finish()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.is_daemon {
            return;
        }
        {
            let mut qs = self.queue.lock().unwrap();
            qs.lifecycle = Lifecycle::Finishing;
        }
        self.work_available.notify_all();
        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }
}

// --- Process-wide default pool ---------------------------------------

static DEFAULT_POOL_THREADS: AtomicUsize = AtomicUsize::new(0);
static DEFAULT_POOL: OnceLock<TaskPool> = OnceLock::new();

/// Reads the configured thread count for the (not-yet-built) default
/// pool, or `totalCPUs - 1` if it has never been set.
pub fn default_pool_threads() -> usize {
    let configured = DEFAULT_POOL_THREADS.load(Ordering::Relaxed);
    if configured != 0 {
        return configured;
    }
    num_cpus::get().saturating_sub(1)
}

/// Sets the number of workers the process-global default pool will be
/// created with. Has no effect if [`default_pool`] has already been
/// called at least once.
pub fn set_default_pool_threads(n: usize) {
    DEFAULT_POOL_THREADS.store(n.max(1), Ordering::Relaxed);
}

/// The lazily-constructed, process-wide pool of size `totalCPUs - 1`
/// (or [`set_default_pool_threads`]'s value) whose workers are
/// daemons. Safe to call concurrently from multiple threads; built
/// exactly once under a one-shot lock.
pub fn default_pool() -> &'static TaskPool {
    DEFAULT_POOL.get_or_init(|| {
        TaskPoolBuilder::new()
            .num_threads(default_pool_threads())
            .is_daemon(true)
            .thread_name("task_pool-default".to_string())
            .build()
            .expect("failed to spawn the default pool's worker threads")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_worker_pool_has_no_threads() {
        let pool = TaskPool::new(0).unwrap();
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn finish_drains_then_workers_exit() {
        let pool = TaskPool::new(2).unwrap();
        let task = pool.spawn(|| 1 + 1);
        pool.finish();
        assert_eq!(*task.yield_force().unwrap(), 2);
    }

    #[test]
    fn scope_joins_borrowed_data_before_returning() {
        let pool = TaskPool::new(2).unwrap();
        let mut values = [1, 2, 3, 4];
        let doubled = pool.scope(|scope| {
            for v in values.iter_mut() {
                scope.spawn(move || *v * 2);
            }
        });
        assert_eq!(doubled, vec![2, 4, 6, 8]);
    }
}
