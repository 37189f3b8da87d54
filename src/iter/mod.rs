//! Data-parallel combinators implemented on top of [`crate::pool`]:
//! [`foreach::for_each`], [`map::par_map`], [`lazy::AsyncBuffer`], and
//! [`reduce::par_reduce`].
//!
//! None of these spawn their own workers — they all submit work units
//! to a caller-supplied [`crate::pool::TaskPool`] via
//! [`crate::pool::TaskPool::scope`], so forcing one (explicitly or by
//! the combinator returning) carries the same full-memory-barrier
//! guarantee as forcing any other [`crate::task::Task`].

pub mod foreach;
pub mod lazy;
pub mod map;
pub mod reduce;

pub use crate::error::ForEachError;
pub use foreach::{for_each, for_each_buffered, for_each_indexed, for_each_iter};
pub use lazy::{AsyncBuffer, LazyMap};
pub use map::{par_map, par_map_into};
pub use reduce::{par_reduce, par_reduce_multi2};

use crate::pool::TaskPool;

/// Default work-unit size for a range of `len` elements on `pool`:
/// enough chunks to keep roughly four per worker busy (matching
/// spec.md §4.5's resubmitter window sizing), but never smaller than
/// one element per chunk.
pub(crate) fn default_work_unit_size(len: usize, pool: &TaskPool) -> usize {
    let workers = pool.thread_count().max(1);
    let target_chunks = workers * 4;
    (len / target_chunks).max(1)
}

/// A capability tag a source range can expose to let a downstream
/// combinator take ownership of an already-filled buffer instead of
/// copying it element-by-element.
///
/// This is the "explicit capability tag" alternative to structurally
/// matching on a source range's private fields, called out as the
/// cleaner option in spec.md §9's Open Question (c). [`lazy::AsyncBuffer`]
/// and [`lazy::LazyMap`] implement it; [`foreach::for_each_buffered`]
/// consumes it.
pub trait SwapSource<T> {
    /// Takes ownership of the next filled buffer, overriding the
    /// caller's work-unit size with the buffer's length. Returns
    /// `None` once the source is exhausted.
    fn swap_take(&mut self) -> Option<Vec<T>>;
}
