//! Error types for the task pool and its parallel combinators.

use std::any::Any;
use std::fmt;

/// Infrastructure-level failures surfaced directly to the caller.
///
/// Per the propagation policy the pool never crashes on task-level
/// failures; these variants cover only the handful of programming
/// errors and the one fatal infrastructure failure (spawning a worker
/// thread) that are caller-visible immediately rather than funneled
/// through a task's stored exception.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TaskPoolError {
    /// `force`/`done` was called on a task that was never submitted to
    /// a pool nor executed via [`crate::task::Task::run_in_new_thread`].
    #[error("force called on a task that was never submitted")]
    NotSubmitted,

    /// The task was already submitted to (or is already running in) a
    /// pool; a task may be submitted to at most one pool at a time.
    #[error("task already submitted to a pool")]
    AlreadySubmitted,

    /// The OS refused to spawn a worker thread when the pool was
    /// constructed.
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// The payload captured from a task body that panicked.
///
/// Rust has no checked exceptions, so the "exception" the spec refers
/// to specializes to a caught [`std::panic::catch_unwind`] payload.
#[derive(Debug, Clone)]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError { message }
    }

    /// The task's panic message, or a placeholder if the payload was
    /// not a `&str`/`String`.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task panicked: {}", self.message)
    }
}

impl std::error::Error for TaskError {}

/// Aggregated exceptions from a combinator's work units.
///
/// Mirrors spec.md's `cause`/`next` chain as an explicit `Vec` in
/// submission order: the head is the first exception observed, and
/// every later one is appended rather than dropped.
#[derive(Debug, Clone)]
pub struct ExceptionChain {
    causes: Vec<TaskError>,
}

impl ExceptionChain {
    pub(crate) fn from_causes(causes: Vec<TaskError>) -> Option<Self> {
        if causes.is_empty() {
            None
        } else {
            Some(ExceptionChain { causes })
        }
    }

    /// The first exception observed across all work units.
    pub fn head(&self) -> &TaskError {
        &self.causes[0]
    }

    /// Every captured exception, in the order they were observed.
    pub fn causes(&self) -> &[TaskError] {
        &self.causes
    }
}

impl fmt::Display for ExceptionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} task(s) failed:", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            writeln!(f, "  [{i}] {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ExceptionChain {}

/// Raised when a parallel for-each body attempts to break out via
/// non-local control flow that the combinator cannot roll back.
#[derive(Debug, thiserror::Error)]
#[error("non-local break out of a parallel for-each body is not supported")]
pub struct ParallelForeachError;

/// The error type returned by the `for_each*` family (spec.md §4.5 /
/// §7.5): either one or more work units panicked, or a body returned
/// `ControlFlow::Break` — an illegal non-local break, since for-each's
/// loop state is sharded across workers and cannot be rolled back.
/// A break takes precedence: once one is observed, the combinator
/// reports it rather than any panics from concurrently running units.
#[derive(Debug, thiserror::Error)]
pub enum ForEachError {
    #[error(transparent)]
    Exceptions(#[from] ExceptionChain),
    #[error(transparent)]
    Break(#[from] ParallelForeachError),
}

/// Collects per-work-unit outcomes into either the ordered list of
/// successes, or the exception chain if any work unit failed.
///
/// The first failure in submission order becomes the chain head,
/// exactly as spec.md's combinator aggregation calls for.
pub(crate) fn aggregate<T>(results: Vec<Result<T, TaskError>>) -> Result<Vec<T>, ExceptionChain> {
    let mut oks = Vec::with_capacity(results.len());
    let mut errs = Vec::new();
    for r in results {
        match r {
            Ok(v) => oks.push(v),
            Err(e) => errs.push(e),
        }
    }
    match ExceptionChain::from_causes(errs) {
        Some(chain) => Err(chain),
        None => Ok(oks),
    }
}
