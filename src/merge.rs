/// Pull-based k-way merge of independently ordered streams.
///
/// Given N iterators that are each ordered by some key, [`SortedMerge`]
/// yields the union in global key order without buffering more than one
/// pending item per source. At every step it advances whichever source holds
/// the smallest next key; ties break by source index, so the merge is stable
/// with respect to source order.
///
/// Nothing is precomputed: dropping the merge (or applying `.take(n)`)
/// cancels all remaining work, which is what lets federated queries carry a
/// result limit without materializing the full match set.
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Lazy k-way merge iterator. See the module docs.
pub struct SortedMerge<I, K, F>
where
    I: Iterator,
    K: Ord,
    F: Fn(&I::Item) -> K,
{
    sources: Vec<I>,
    pending: Vec<Option<I::Item>>,
    heap: BinaryHeap<Reverse<(K, usize)>>,
    key_fn: F,
}

impl<I, K, F> SortedMerge<I, K, F>
where
    I: Iterator,
    K: Ord,
    F: Fn(&I::Item) -> K,
{
    /// Merge `sources`, each of which must already be ordered by `key_fn`.
    pub fn new(sources: Vec<I>, key_fn: F) -> Self {
        let mut merge = Self {
            pending: Vec::with_capacity(sources.len()),
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            key_fn,
        };
        for idx in 0..merge.sources.len() {
            merge.pending.push(None);
            merge.advance(idx);
        }
        merge
    }

    /// Pull the next item from source `idx` into the heap.
    fn advance(&mut self, idx: usize) {
        if let Some(item) = self.sources[idx].next() {
            let key = (self.key_fn)(&item);
            self.pending[idx] = Some(item);
            self.heap.push(Reverse((key, idx)));
        }
    }
}

impl<I, K, F> Iterator for SortedMerge<I, K, F>
where
    I: Iterator,
    K: Ord,
    F: Fn(&I::Item) -> K,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, idx)) = self.heap.pop()?;
        let item = self.pending[idx].take();
        debug_assert!(item.is_some(), "heap entry without pending item");
        self.advance(idx);
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_preserves_global_order() {
        let a = vec![1, 4, 7];
        let b = vec![2, 5, 8];
        let c = vec![3, 6, 9];
        let merged: Vec<i32> =
            SortedMerge::new(vec![a.into_iter(), b.into_iter(), c.into_iter()], |v| *v).collect();
        assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_merge_equals_sorted_union() {
        let a = vec![1, 1, 3, 10];
        let b = vec![2, 3, 3];
        let c: Vec<i32> = vec![];
        let merged: Vec<i32> =
            SortedMerge::new(vec![a.clone().into_iter(), b.clone().into_iter(), c.into_iter()], |v| {
                *v
            })
            .collect();
        let mut expected = [a, b].concat();
        expected.sort();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_merge_ties_are_stable_by_source() {
        let a = vec![(1, "a")];
        let b = vec![(1, "b")];
        let merged: Vec<(i32, &str)> =
            SortedMerge::new(vec![a.into_iter(), b.into_iter()], |(k, _)| *k).collect();
        assert_eq!(merged, vec![(1, "a"), (1, "b")]);
    }

    #[test]
    fn test_merge_is_lazy_under_take() {
        // An endless source: take() must terminate without exhausting it.
        let endless = (0..).map(|i| i * 2);
        let finite = vec![1, 3, 5].into_iter();
        let merged: Vec<i32> = SortedMerge::new(
            vec![
                Box::new(endless) as Box<dyn Iterator<Item = i32>>,
                Box::new(finite),
            ],
            |v| *v,
        )
        .take(5)
        .collect();
        assert_eq!(merged, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_no_sources() {
        let merged: Vec<i32> = SortedMerge::new(Vec::<std::vec::IntoIter<i32>>::new(), |v| *v).collect();
        assert!(merged.is_empty());
    }
}
