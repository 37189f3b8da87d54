//! Lazy `ParallelMap`: overlaps pulling (and, for [`LazyMap`], mapping)
//! the *next* buffer with the caller's consumption of the *current*
//! one, rather than eagerly materializing every result up front the
//! way [`crate::iter::map::par_map`] does.

use crate::iter::SwapSource;
use crate::pool::TaskPool;
use crate::task::Task;

/// Double-buffered read-ahead over a non-random-access source: while
/// the caller consumes the buffer returned by one [`swap_take`](SwapSource::swap_take),
/// a pool worker is already filling the next one.
pub struct AsyncBuffer<T: Send + 'static> {
    pool: TaskPool,
    work_unit_size: usize,
    pending: Option<Task<(Vec<T>, Box<dyn Iterator<Item = T> + Send>)>>,
}

impl<T: Send + 'static> AsyncBuffer<T> {
    /// Immediately submits a fill of the first buffer to `pool`, so
    /// it is already in flight by the time the first
    /// [`swap_take`](SwapSource::swap_take) call needs it.
    pub fn new<I>(pool: &TaskPool, work_unit_size: usize, source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        let work_unit_size = work_unit_size.max(1);
        let boxed: Box<dyn Iterator<Item = T> + Send> = Box::new(source.into_iter());
        let pending = Some(Self::spawn_fill(pool, work_unit_size, boxed));
        AsyncBuffer {
            pool: pool.clone(),
            work_unit_size,
            pending,
        }
    }

    fn spawn_fill(
        pool: &TaskPool,
        work_unit_size: usize,
        mut iter: Box<dyn Iterator<Item = T> + Send>,
    ) -> Task<(Vec<T>, Box<dyn Iterator<Item = T> + Send>)> {
        pool.spawn(move || {
            let mut buf = Vec::with_capacity(work_unit_size);
            for _ in 0..work_unit_size {
                match iter.next() {
                    Some(item) => buf.push(item),
                    None => break,
                }
            }
            (buf, iter)
        })
    }
}

impl<T: Send + 'static> SwapSource<T> for AsyncBuffer<T> {
    fn swap_take(&mut self) -> Option<Vec<T>> {
        let task = self.pending.take()?;
        // `yield_force_owned` rather than `spin_force`: the filling task
        // is almost always still running when the caller has finished
        // consuming the previous buffer, so blocking on the
        // finished-condvar avoids burning a core busy-waiting for it.
        // This task is private to this `AsyncBuffer` and forced exactly
        // once, so taking the owned result (rather than cloning an
        // `Arc`) is sound — see `Task::yield_force_owned`.
        let (buf, iter) = task
            .yield_force_owned()
            .unwrap_or_else(|e| panic!("async buffer fill task failed: {e}"));
        if buf.is_empty() {
            return None;
        }
        self.pending = Some(Self::spawn_fill(&self.pool, self.work_unit_size, iter));
        Some(buf)
    }
}

/// An [`AsyncBuffer`] whose source is mapped through `f` on the same
/// background thread that pulls it, so the mapping work for buffer
/// `N + 1` overlaps the caller's consumption of buffer `N` (spec.md
/// §4.6's lazy `ParallelMap`).
pub struct LazyMap<R: Send + 'static> {
    inner: AsyncBuffer<R>,
}

impl<R: Send + 'static> LazyMap<R> {
    pub fn new<T, I, F>(pool: &TaskPool, work_unit_size: usize, source: I, f: F) -> Self
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: FnMut(T) -> R + Send + 'static,
    {
        let mapped = source.into_iter().map(f);
        LazyMap {
            inner: AsyncBuffer::new(pool, work_unit_size, mapped),
        }
    }
}

impl<R: Send + 'static> SwapSource<R> for LazyMap<R> {
    fn swap_take(&mut self) -> Option<Vec<R>> {
        self.inner.swap_take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iter::foreach::for_each_buffered;
    use crate::pool::TaskPool;
    use std::sync::Mutex;

    #[test]
    fn async_buffer_drains_source_in_order_across_buffers() {
        let pool = TaskPool::new(2).unwrap();
        let mut buffer = AsyncBuffer::new(&pool, 10, 0..95);
        let mut drained = Vec::new();
        while let Some(chunk) = buffer.swap_take() {
            drained.extend(chunk);
        }
        assert_eq!(drained, (0..95).collect::<Vec<_>>());
    }

    #[test]
    fn lazy_map_applies_function_while_reading_ahead() {
        let pool = TaskPool::new(2).unwrap();
        let mut source = LazyMap::new(&pool, 4, 1..=20, |x: i32| x * 2);
        let seen = Mutex::new(Vec::new());
        for_each_buffered(&pool, &mut source, |v| {
            seen.lock().unwrap().push(*v);
            std::ops::ControlFlow::Continue(())
        })
        .unwrap();
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (1..=20).map(|x| x * 2).collect::<Vec<_>>());
    }
}
