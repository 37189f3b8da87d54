//! A reusable, work-stealing thread pool for running promise/future
//! style [`Task`]s and the data-parallel combinators built on top of
//! them (`for_each`, `par_map`, lazy map, `par_reduce`).
//!
//! A pool owns a fixed set of worker threads and a shared queue.
//! [`TaskPool::spawn`] hands a closure to the pool and returns a
//! [`Task`] handle that can be polled ([`Task::done`]) or forced
//! ([`Task::spin_force`], [`Task::yield_force`], [`Task::work_force`]);
//! forcing a task that is still queued runs it inline on the forcing
//! thread instead of waiting (the "steal from the middle" fast path).
//! [`TaskPool::scope`] additionally allows spawning tasks that borrow
//! from the calling stack frame, joining all of them before it
//! returns.
//!
//! ```no_run
//! use task_pool::TaskPool;
//!
//! let pool = TaskPool::new(4).unwrap();
//! let task = pool.spawn(|| 6 * 7);
//! assert_eq!(*task.yield_force().unwrap(), 42);
//! ```

mod error;
mod iter;
mod local;
mod pool;
mod task;

pub use error::{ExceptionChain, ForEachError, ParallelForeachError, TaskError, TaskPoolError};
pub use iter::{
    for_each, for_each_buffered, for_each_indexed, for_each_iter, par_map, par_map_into,
    par_reduce, par_reduce_multi2, AsyncBuffer, LazyMap, SwapSource,
};
pub use local::{LocalRange, WorkerLocalStorage};
pub use pool::{default_pool, default_pool_threads, set_default_pool_threads};
pub use pool::{Scope, TaskPool, TaskPoolBuilder};
pub use task::{Priority, Task};
