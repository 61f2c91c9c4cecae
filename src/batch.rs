//! Batch partitioning.
//!
//! A [`Batch`] is the unit of work that flows through a pipeline. Batches are
//! created once, up front, by [`to_batches`]: consecutive fixed-size slices of
//! the input in its original order, numbered from zero. The index is only used
//! for naming outputs and for logging; batches are free to finish out of order.

use crate::queue::Task;

/// An index-ordered group of work items.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch<T> {
    pub index: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The task that carries this batch into the first pipeline stage.
    #[must_use]
    pub fn into_task(self) -> Task<Vec<T>> {
        Task::new(self.index, self.items)
    }
}

/// Split `items` into batches of at most `batch_size` elements.
///
/// Only the last batch may be smaller. `limit` keeps the first N batches, which
/// is handy for trial runs over a large snapshot. A `batch_size` of zero is
/// treated as one.
///
/// ```
/// use snapflow::batch::to_batches;
///
/// let batches = to_batches(vec!["f0", "f1", "f2", "f3", "f4"], 2, None);
/// let items: Vec<Vec<&str>> = batches.into_iter().map(|b| b.items).collect();
/// assert_eq!(items, vec![vec!["f0", "f1"], vec!["f2", "f3"], vec!["f4"]]);
/// ```
pub fn to_batches<T>(items: Vec<T>, batch_size: usize, limit: Option<usize>) -> Vec<Batch<T>> {
    let size = batch_size.max(1);
    let max = limit.unwrap_or(usize::MAX);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size).min(max));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() && batches.len() < max {
        let chunk: Vec<T> = iter.by_ref().take(size).collect();
        batches.push(Batch { index: batches.len(), items: chunk });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_batches() {
        assert!(to_batches(Vec::<u32>::new(), 4, None).is_empty());
    }

    #[test]
    fn limit_keeps_leading_batches() {
        let b = to_batches((0..10).collect(), 3, Some(2));
        assert_eq!(b.len(), 2);
        assert_eq!(b[1].items, vec![3, 4, 5]);
    }

    #[test]
    fn zero_size_is_one() {
        let b = to_batches(vec![1, 2], 0, None);
        assert_eq!(b.len(), 2);
    }
}
