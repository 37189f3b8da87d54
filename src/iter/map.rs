//! Eager `ParallelMap`: splits a random-access range into contiguous
//! chunks and writes results into disjoint slices of an output
//! buffer, so no synchronization is needed across chunks.

use std::panic::AssertUnwindSafe;

use crate::error::{aggregate, ExceptionChain, TaskError};
use crate::iter::default_work_unit_size;
use crate::pool::TaskPool;

/// Applies `f` to every element of `input`, returning a freshly
/// allocated `Vec` of results in input order. Exceptions from multiple
/// chunks are aggregated exactly as in [`crate::iter::for_each`].
pub fn par_map<T, R, F>(
    pool: &TaskPool,
    input: &[T],
    work_unit_size: Option<usize>,
    f: F,
) -> Result<Vec<R>, ExceptionChain>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Send + Sync,
{
    let len = input.len();
    if len == 0 {
        return Ok(Vec::new());
    }
    let unit = work_unit_size.unwrap_or_else(|| default_work_unit_size(len, pool));
    let f = &f;

    let results: Vec<Result<Vec<R>, TaskError>> = pool.scope(|scope| {
        for chunk in input.chunks(unit) {
            scope.spawn(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    chunk.iter().map(f).collect::<Vec<R>>()
                }))
                .map_err(TaskError::from_panic)
            });
        }
    });

    aggregate(results).map(|chunks| chunks.into_iter().flatten().collect())
}

/// Like [`par_map`], but writes into a caller-supplied `output` buffer
/// of the same length as `input` rather than allocating one. Each
/// chunk writes to a disjoint slice of `output`, so no locking is
/// needed on it.
pub fn par_map_into<T, R, F>(
    pool: &TaskPool,
    input: &[T],
    output: &mut [R],
    work_unit_size: Option<usize>,
    f: F,
) -> Result<(), ExceptionChain>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Send + Sync,
{
    assert_eq!(
        input.len(),
        output.len(),
        "par_map_into: output buffer length must match input length"
    );
    let len = input.len();
    if len == 0 {
        return Ok(());
    }
    let unit = work_unit_size.unwrap_or_else(|| default_work_unit_size(len, pool));
    let f = &f;

    let results: Vec<Result<(), TaskError>> = pool.scope(|scope| {
        for (in_chunk, out_chunk) in input.chunks(unit).zip(output.chunks_mut(unit)) {
            scope.spawn(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| {
                    for (slot, x) in out_chunk.iter_mut().zip(in_chunk.iter()) {
                        *slot = f(x);
                    }
                }))
                .map_err(TaskError::from_panic)
            });
        }
    });

    aggregate(results).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::TaskPool;

    #[test]
    fn maps_squares_into_a_fresh_buffer() {
        // Scenario 3.
        let pool = TaskPool::new(2).unwrap();
        let input = [1, 2, 3, 4, 5];
        let output = par_map(&pool, &input, None, |x| x * x).unwrap();
        assert_eq!(output, vec![1, 4, 9, 16, 25]);
    }

    #[test]
    fn maps_squares_into_a_preallocated_buffer() {
        let pool = TaskPool::new(2).unwrap();
        let input = [1, 2, 3, 4, 5];
        let mut output = [0; 5];
        par_map_into(&pool, &input, &mut output, None, |x| x * x).unwrap();
        assert_eq!(output, [1, 4, 9, 16, 25]);
    }

    #[test]
    fn empty_input_maps_to_empty_output() {
        let pool = TaskPool::new(2).unwrap();
        let input: [i32; 0] = [];
        let output = par_map(&pool, &input, None, |x| x * x).unwrap();
        assert!(output.is_empty());
    }
}
