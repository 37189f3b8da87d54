//! `ParallelReduce`: combines contiguous chunks with an associative
//! function, then folds the per-chunk partial results together on the
//! calling thread.

use std::panic::AssertUnwindSafe;

use crate::error::{aggregate, ExceptionChain, TaskError};
use crate::iter::default_work_unit_size;
use crate::pool::TaskPool;

/// Number of independent accumulator "lanes" used when reducing a
/// single chunk, matching spec.md §4.7's instruction-level-parallelism
/// detail: interleaving several independent accumulation chains lets
/// the CPU pipeline the combining function's latency instead of
/// serializing on one long dependency chain.
const REDUCE_LANES: usize = 6;

/// Reduces `items` with the associative function `f`. If `seed` is
/// given, it is combined with every chunk's partial result (useful
/// when `f`'s identity element isn't `T::default()`); otherwise the
/// first chunk's result seeds the fold and an empty `items` is an
/// error to call with no seed.
pub fn par_reduce<T, F>(
    pool: &TaskPool,
    items: &[T],
    seed: Option<T>,
    work_unit_size: Option<usize>,
    f: F,
) -> Result<T, ExceptionChain>
where
    T: Clone + Send + Sync,
    F: Fn(T, T) -> T + Send + Sync,
{
    if items.is_empty() {
        return Ok(seed.expect("par_reduce over an empty range requires an explicit seed"));
    }
    let len = items.len();
    let unit = work_unit_size.unwrap_or_else(|| default_work_unit_size(len, pool));
    let f = &f;

    let results: Vec<Result<T, TaskError>> = pool.scope(|scope| {
        for chunk in items.chunks(unit) {
            scope.spawn(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| reduce_chunk(chunk, f)))
                    .map_err(TaskError::from_panic)
            });
        }
    });

    let chunk_results = aggregate(results)?;
    let mut chunk_results = chunk_results.into_iter();
    let mut acc = match seed {
        Some(s) => s,
        None => chunk_results
            .next()
            .expect("non-empty range guarantees at least one chunk"),
    };
    for v in chunk_results {
        acc = f(acc, v);
    }
    Ok(acc)
}

/// Reduces `items` with two independent associative functions `f1` and
/// `f2` in a single pass over the data (spec.md §4.7's
/// `reduce!(fun1, fun2)` overload — e.g. computing a min and a max
/// together).
pub fn par_reduce_multi2<T, F1, F2>(
    pool: &TaskPool,
    items: &[T],
    seeds: Option<(T, T)>,
    work_unit_size: Option<usize>,
    f1: F1,
    f2: F2,
) -> Result<(T, T), ExceptionChain>
where
    T: Clone + Send + Sync,
    F1: Fn(T, T) -> T + Send + Sync,
    F2: Fn(T, T) -> T + Send + Sync,
{
    if items.is_empty() {
        return Ok(seeds.expect("par_reduce_multi2 over an empty range requires explicit seeds"));
    }
    let len = items.len();
    let unit = work_unit_size.unwrap_or_else(|| default_work_unit_size(len, pool));
    let f1 = &f1;
    let f2 = &f2;

    let results: Vec<Result<(T, T), TaskError>> = pool.scope(|scope| {
        for chunk in items.chunks(unit) {
            scope.spawn(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    (reduce_chunk(chunk, f1), reduce_chunk(chunk, f2))
                }))
                .map_err(TaskError::from_panic)
            });
        }
    });

    let chunk_results = aggregate(results)?;
    let mut chunk_results = chunk_results.into_iter();
    let (mut acc1, mut acc2) = match seeds {
        Some(s) => s,
        None => chunk_results
            .next()
            .expect("non-empty range guarantees at least one chunk"),
    };
    for (v1, v2) in chunk_results {
        acc1 = f1(acc1, v1);
        acc2 = f2(acc2, v2);
    }
    Ok((acc1, acc2))
}

/// Reduces a single non-empty chunk using `REDUCE_LANES` interleaved
/// accumulators, then folds the lanes together.
fn reduce_chunk<T, F>(chunk: &[T], f: &F) -> T
where
    T: Clone,
    F: Fn(T, T) -> T,
{
    debug_assert!(!chunk.is_empty(), "reduce_chunk called on an empty chunk");
    if chunk.len() <= REDUCE_LANES {
        let mut it = chunk.iter().cloned();
        let mut acc = it.next().expect("chunk is non-empty");
        for v in it {
            acc = f(acc, v);
        }
        return acc;
    }

    let mut lanes: Vec<Option<T>> = vec![None; REDUCE_LANES];
    for (i, v) in chunk.iter().cloned().enumerate() {
        let lane = &mut lanes[i % REDUCE_LANES];
        *lane = Some(match lane.take() {
            None => v,
            Some(acc) => f(acc, v),
        });
    }
    let mut it = lanes.into_iter().flatten();
    let mut acc = it.next().expect("at least one lane was filled");
    for v in it {
        acc = f(acc, v);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;

    #[test]
    fn sums_a_range_without_a_seed() {
        // Scenario 4.
        let pool = TaskPool::new(4).unwrap();
        let items: Vec<i64> = (1..=100).collect();
        let sum = par_reduce(&pool, &items, None, None, |a, b| a + b).unwrap();
        assert_eq!(sum, (1..=100i64).sum::<i64>());
    }

    #[test]
    fn sums_with_an_explicit_seed() {
        let pool = TaskPool::new(2).unwrap();
        let items = [1, 2, 3, 4];
        let sum = par_reduce(&pool, &items, Some(100), Some(1), |a, b| a + b).unwrap();
        assert_eq!(sum, 110);
    }

    #[test]
    fn reduces_min_and_max_in_one_pass() {
        let pool = TaskPool::new(4).unwrap();
        let items = [5, 3, 9, 1, 7, 2, 8, 4, 6];
        let (min, max) =
            par_reduce_multi2(&pool, &items, None, Some(2), |a, b| a.min(b), |a, b| a.max(b))
                .unwrap();
        assert_eq!((min, max), (1, 9));
    }

    #[test]
    fn empty_range_with_seed_returns_seed() {
        let pool = TaskPool::new(2).unwrap();
        let items: [i32; 0] = [];
        let sum = par_reduce(&pool, &items, Some(0), None, |a, b| a + b).unwrap();
        assert_eq!(sum, 0);
    }
}
