//! `ParallelForeach`: lazily generates work units over a range and
//! submits them to a pool, aggregating exceptions.
//!
//! A body may signal `ControlFlow::Break(())` to request a non-local
//! break out of the loop; since the range is sharded across workers,
//! there is no way to roll back work units that already ran, so this
//! is reported as [`ParallelForeachError`] rather than honored
//! (spec.md §1 / §7.5).

use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ExceptionChain, ForEachError, ParallelForeachError, TaskError};
use crate::iter::default_work_unit_size;
use crate::iter::SwapSource;
use crate::pool::TaskPool;

type UnitResult = Result<ControlFlow<()>, TaskError>;

/// Turns per-work-unit outcomes into a [`ForEachError`], or `Ok(())`
/// if every unit completed without panicking or breaking. A break in
/// any unit takes precedence over panics observed in others.
fn finish(results: Vec<UnitResult>) -> Result<(), ForEachError> {
    let mut broke = false;
    let mut causes = Vec::new();
    for r in results {
        match r {
            Ok(ControlFlow::Break(())) => broke = true,
            Ok(ControlFlow::Continue(())) => {}
            Err(e) => causes.push(e),
        }
    }
    if broke {
        return Err(ForEachError::Break(ParallelForeachError));
    }
    match ExceptionChain::from_causes(causes) {
        Some(chain) => Err(ForEachError::Exceptions(chain)),
        None => Ok(()),
    }
}

/// Runs `body(&mut element)` for every element of `items`, in
/// work units of `work_unit_size` (or a pool-derived default),
/// across `pool`'s workers.
///
/// Element visitation order is unspecified relative to submission
/// (spec.md §1 Non-goals); every element up to an observed break or
/// panic is visited. A full memory barrier is implied by the join
/// inside [`TaskPool::scope`], so every worker's writes are visible to
/// the caller once this returns.
pub fn for_each<T, F>(
    pool: &TaskPool,
    items: &mut [T],
    work_unit_size: Option<usize>,
    body: F,
) -> Result<(), ForEachError>
where
    T: Send,
    F: Fn(&mut T) -> ControlFlow<()> + Send + Sync,
{
    for_each_indexed(pool, items, work_unit_size, move |_, item| body(item))
}

/// Like [`for_each`], but `body` also receives each element's index
/// within `items`.
pub fn for_each_indexed<T, F>(
    pool: &TaskPool,
    items: &mut [T],
    work_unit_size: Option<usize>,
    body: F,
) -> Result<(), ForEachError>
where
    T: Send,
    F: Fn(usize, &mut T) -> ControlFlow<()> + Send + Sync,
{
    let len = items.len();
    if len == 0 {
        return Ok(());
    }
    let unit = work_unit_size.unwrap_or_else(|| default_work_unit_size(len, pool));
    let body = &body;
    let stop_submitting = AtomicBool::new(false);
    let stop_submitting = &stop_submitting;

    let results: Vec<UnitResult> = pool.scope(|scope| {
        let mut start = 0usize;
        for chunk in items.chunks_mut(unit) {
            // Stop submitting further work units as soon as any
            // already-running one has panicked or broken; units
            // already enqueued still run to completion via the scope
            // join below.
            if stop_submitting.load(Ordering::Acquire) {
                break;
            }
            let base = start;
            start += chunk.len();
            scope.spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut flow = ControlFlow::Continue(());
                    for (offset, item) in chunk.iter_mut().enumerate() {
                        flow = body(base + offset, item);
                        if flow.is_break() {
                            break;
                        }
                    }
                    flow
                }));
                if outcome.is_err() || matches!(outcome, Ok(ControlFlow::Break(()))) {
                    stop_submitting.store(true, Ordering::Release);
                }
                outcome.map_err(TaskError::from_panic)
            });
        }
    });

    finish(results)
}

/// Like [`for_each`], but for sources that are not random-access: `src`
/// is drained on the calling thread into buffers of `work_unit_size`
/// elements, and each buffer is processed the same way a contiguous
/// slice chunk would be (spec.md §4.5's "non-random-access ranges"
/// case).
pub fn for_each_iter<T, I, F>(
    pool: &TaskPool,
    src: I,
    work_unit_size: usize,
    body: F,
) -> Result<(), ForEachError>
where
    T: Send,
    I: IntoIterator<Item = T>,
    F: Fn(&mut T) -> ControlFlow<()> + Send + Sync,
{
    let work_unit_size = work_unit_size.max(1);
    let body = &body;
    let stop_submitting = AtomicBool::new(false);
    let stop_submitting = &stop_submitting;
    let mut src = src.into_iter();

    let results: Vec<UnitResult> = pool.scope(|scope| loop {
        if stop_submitting.load(Ordering::Acquire) {
            break;
        }
        let mut buf: Vec<T> = Vec::with_capacity(work_unit_size);
        for _ in 0..work_unit_size {
            match src.next() {
                Some(item) => buf.push(item),
                None => break,
            }
        }
        if buf.is_empty() {
            break;
        }
        let mut buf = buf;
        scope.spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                let mut flow = ControlFlow::Continue(());
                for item in buf.iter_mut() {
                    flow = body(item);
                    if flow.is_break() {
                        break;
                    }
                }
                flow
            }));
            if outcome.is_err() || matches!(outcome, Ok(ControlFlow::Break(()))) {
                stop_submitting.store(true, Ordering::Release);
            }
            outcome.map_err(TaskError::from_panic)
        });
    });

    finish(results)
}

/// The buffer-swap fast path (spec.md §4.5 special case / §9 Open
/// Question (c)): when the input is the output of this pool's lazy
/// map or [`crate::iter::AsyncBuffer`], its filled buffer is moved
/// into `body`'s work units instead of being copied, and the
/// work-unit size is overridden by the source's buffer size.
pub fn for_each_buffered<T, S, F>(
    pool: &TaskPool,
    source: &mut S,
    body: F,
) -> Result<(), ForEachError>
where
    T: Send,
    S: SwapSource<T>,
    F: Fn(&mut T) -> ControlFlow<()> + Send + Sync,
{
    let body = &body;
    let stop_submitting = AtomicBool::new(false);
    let stop_submitting = &stop_submitting;

    let results: Vec<UnitResult> = pool.scope(|scope| {
        while let Some(mut buf) = source.swap_take() {
            if stop_submitting.load(Ordering::Acquire) {
                break;
            }
            scope.spawn(move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut flow = ControlFlow::Continue(());
                    for item in buf.iter_mut() {
                        flow = body(item);
                        if flow.is_break() {
                            break;
                        }
                    }
                    flow
                }));
                if outcome.is_err() || matches!(outcome, Ok(ControlFlow::Break(()))) {
                    stop_submitting.store(true, Ordering::Release);
                }
                outcome.map_err(TaskError::from_panic)
            });
        }
    });

    finish(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;
    use std::sync::Mutex;

    #[test]
    fn increments_every_element_exactly_once() {
        // Scenario 2.
        let pool = TaskPool::new(2).unwrap();
        let mut items = vec![1, 2, 3, 4, 5];
        for_each(&pool, &mut items, None, |e| {
            *e += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(items, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn indexed_overload_sees_every_index() {
        let pool = TaskPool::new(2).unwrap();
        let mut items = vec![10, 20, 30, 40, 50];
        let seen = Mutex::new(Vec::new());
        for_each_indexed(&pool, &mut items, None, |i, _| {
            seen.lock().unwrap().push(i);
            ControlFlow::Continue(())
        })
        .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn aggregates_exceptions_and_still_visits_every_element() {
        // Scenario 5: body throws on element 37 and element 63 out of
        // 100; both appear in the chain; all elements are visited.
        let pool = TaskPool::new(4).unwrap();
        let mut items: Vec<i32> = (0..100).collect();
        let visited = Mutex::new(vec![false; 100]);
        let result = for_each_indexed(&pool, &mut items, Some(1), |i, _| {
            visited.lock().unwrap()[i] = true;
            if i == 37 || i == 63 {
                panic!("boom at {i}");
            }
            ControlFlow::Continue(())
        });
        let chain = match result.unwrap_err() {
            ForEachError::Exceptions(chain) => chain,
            ForEachError::Break(_) => panic!("expected exceptions, not a break"),
        };
        assert_eq!(chain.causes().len(), 2);
        assert!(visited.into_inner().unwrap().iter().all(|&v| v));
    }

    #[test]
    fn illegal_break_is_reported_as_a_dedicated_error() {
        // Scenario 5 (break variant, spec.md §1 / §7.5).
        let pool = TaskPool::new(4).unwrap();
        let mut items: Vec<i32> = (0..100).collect();
        let result = for_each_indexed(&pool, &mut items, Some(1), |i, _| {
            if i == 50 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert!(matches!(result, Err(ForEachError::Break(_))));
    }
}
