//! Indexable lazy sequence views
//!
//! This module provides the core [`Sequence`] contract and the lazy view
//! combinators built on top of it. A sequence is anything with a known
//! length (or no length at all, for unbounded views) and random access by
//! index. Views never evaluate ahead of time: every `get` re-triggers the
//! upstream chain, so the cost of an item is paid exactly when it is read.
//!
//! ## Indexing discipline
//!
//! Finite views accept indices in `[-len, len)` with Python-style negative
//! indexing; negative indices are normalized before delegation. Unbounded
//! views accept any nonnegative index and reject negative ones, since there
//! is no length to count back from.
//!
//! ## Example
//!
//! ```rust
//! use slipstream::sequence::{Sequence, SequenceExt};
//!
//! let data = vec![1u32, 2, 3, 4, 5];
//! let doubled = data.smap(|x| x * 2);
//! assert_eq!(doubled.get(1).unwrap(), 4);
//! assert_eq!(doubled.get(-1).unwrap(), 10);
//! ```

pub mod caching;
pub mod indexing;
pub mod mapping;
pub mod shape;
pub mod uniter;

pub use caching::{ add_cache, CachedSeq };
pub use indexing::{ cycle, gather, interleave, repeat, take, Cycle, Gathered, Interleaved, Repeat };
pub use mapping::{ smap, starmap, try_smap, zip, Mapped, TryMapped, Zipped };
pub use shape::{
    batch,
    collate,
    concatenate,
    split,
    unbatch,
    Batched,
    Collated,
    Concatenated,
    Edges,
    SplitSeq,
    Unbatched,
};
pub use uniter::{ uniter, Uniter };

use std::sync::Arc;

use crate::error::{ Result, SlipstreamError };

/// The contract every lazy view implements.
///
/// `get` takes `&self` so that prefetch workers can evaluate the same view
/// concurrently through an `Arc`; views with internal state (caches, the
/// prefetcher itself) use interior mutability.
pub trait Sequence {
    /// Element type produced by this view
    type Item;

    /// Number of items, or `None` for an unbounded view
    fn len(&self) -> Option<usize>;

    /// Read the item at `index`.
    ///
    /// Accepts `[-len, len)` for finite views; unbounded views reject
    /// negative indices.
    fn get(&self, index: i64) -> Result<Self::Item>;

    /// Whether the view is known to contain no items
    fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl<S: Sequence + ?Sized> Sequence for &S {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        (**self).len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        (**self).get(index)
    }
}

impl<S: Sequence + ?Sized> Sequence for Arc<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        (**self).len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        (**self).get(index)
    }
}

impl<S: Sequence + ?Sized> Sequence for Box<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        (**self).len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        (**self).get(index)
    }
}

impl<T: Clone> Sequence for [T] {
    type Item = T;

    fn len(&self) -> Option<usize> {
        Some(<[T]>::len(self))
    }

    fn get(&self, index: i64) -> Result<T> {
        let i = resolve_index(index, Sequence::len(self))?;
        Ok(self[i].clone())
    }
}

impl<T: Clone> Sequence for Vec<T> {
    type Item = T;

    fn len(&self) -> Option<usize> {
        Some(Vec::len(self))
    }

    fn get(&self, index: i64) -> Result<T> {
        let i = resolve_index(index, Sequence::len(self))?;
        Ok(self[i].clone())
    }
}

/// Normalize `index` against `len`, applying negative indexing for finite
/// views and rejecting negative indices on unbounded ones.
pub(crate) fn resolve_index(index: i64, len: Option<usize>) -> Result<usize> {
    match len {
        Some(n) => {
            let n_i = n as i64;
            if index < -n_i || index >= n_i {
                Err(SlipstreamError::IndexOutOfRange { index, len: n })
            } else if index < 0 {
                Ok((n_i + index) as usize)
            } else {
                Ok(index as usize)
            }
        }
        None => {
            if index < 0 {
                Err(SlipstreamError::invalid_index(format!(
                    "cannot use index {index} relative to the length of an unbounded sequence"
                )))
            } else {
                Ok(index as usize)
            }
        }
    }
}

/// Iterator over a borrowed sequence, yielding `get(0), get(1), …`.
///
/// Unbounded for views without a length.
pub struct SeqIter<'a, S: Sequence + ?Sized> {
    seq: &'a S,
    pos: i64,
    len: Option<usize>,
}

impl<S: Sequence + ?Sized> Iterator for SeqIter<'_, S> {
    type Item = Result<S::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(n) = self.len {
            if self.pos >= n as i64 {
                return None;
            }
        }
        let item = self.seq.get(self.pos);
        self.pos += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.len {
            Some(n) => {
                let left = n.saturating_sub(self.pos as usize);
                (left, Some(left))
            }
            None => (usize::MAX, None),
        }
    }
}

/// Combinator methods available on every [`Sequence`].
pub trait SequenceExt: Sequence + Sized {
    /// Lazy mapping of `f` over this view; no memoization
    fn smap<O, F>(self, f: F) -> Mapped<Self, F> where F: Fn(Self::Item) -> O {
        mapping::smap(f, self)
    }

    /// Lazy mapping of a fallible `f` over this view
    fn try_smap<O, F>(self, f: F) -> TryMapped<Self, F>
        where F: Fn(Self::Item) -> std::result::Result<O, crate::error::BoxError>
    {
        mapping::try_smap(f, self)
    }

    /// Pair this view with another one; length is the shorter of the two
    fn zip<B: Sequence>(self, other: B) -> Zipped<Self, B> {
        mapping::zip(self, other)
    }

    /// Reorder this view through an index array
    fn gather(self, indices: Vec<i64>) -> Gathered<Self> {
        indexing::gather(self, indices)
    }

    /// Repeat this view, up to `limit` items or without bound
    fn cycle(self, limit: Option<usize>) -> Result<Cycle<Self>> {
        indexing::cycle(self, limit)
    }

    /// Group items in blocks of `k`
    fn batch(self, k: usize, drop_last: bool, pad: Option<Self::Item>) -> Result<Batched<Self>> {
        shape::batch(self, k, drop_last, pad)
    }

    /// Undo a batching view of block size `k`
    fn unbatch(self, k: usize, last_k: Option<usize>) -> Result<Unbatched<Self>>
        where Self::Item: Sequence
    {
        shape::unbatch(self, k, last_k)
    }

    /// Cut this view into contiguous subsequences
    fn split(self, edges: Edges) -> Result<SplitSeq<Self>> where Self: Clone {
        shape::split(self, edges)
    }

    /// Keep the most recently read items in a small thread-safe cache
    fn add_cache(self, cache_size: usize) -> CachedSeq<Self> where Self::Item: Clone {
        caching::add_cache(self, cache_size)
    }

    /// Take a `[start, stop)` view with the given step.
    ///
    /// Bounds follow Python slice semantics; `None` means "from the edge".
    /// Slicing a slice composes into a single flattened descriptor.
    fn slice(self, start: Option<i64>, stop: Option<i64>, step: Option<i64>) -> Result<SliceView<Self>> {
        SliceView::new(self, start, stop, step)
    }

    /// Iterate this view from the front.
    ///
    /// Named `items` rather than `iter` so that containers which are both
    /// sequences and collections (`Vec`, slices) keep their std iterator.
    fn items(&self) -> SeqIter<'_, Self> {
        SeqIter { seq: self, pos: 0, len: self.len() }
    }
}

impl<S: Sequence + Sized> SequenceExt for S {}

/// Normalize slice bounds so that `start` and `stop` are nonnegative and
/// `stop = start + k * step` for some integer `k >= 0`.
pub(crate) fn normalize_slice(
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
    size: usize,
) -> Result<(i64, i64, i64)> {
    let size = size as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(SlipstreamError::value_out_of_range("slice step cannot be 0"));
    }

    // a forward slice may start at `size` (empty), a backward one at most
    // on the last element
    let upper = if step > 0 { size } else { size - 1 };
    let mut start = match start {
        None => if step > 0 { 0 } else { size - 1 },
        Some(s) if s >= 0 => s.min(upper),
        Some(s) => (size + s).max(0),
    };
    let mut stop = match stop {
        None => if step > 0 { size } else { -1 },
        Some(s) if s >= 0 => s.min(size),
        Some(s) => (size + s).max(-1),
    };

    if (stop - start) * step.signum() < 0 {
        stop = start;
    }
    if size == 0 {
        start = 0;
        stop = 0;
    }

    // round stop so the span divides evenly by step
    let span = (stop - start).abs() - 1;
    let abs_step = step.abs();
    let numel = if span < 0 { 0 } else { (span + abs_step - span.rem_euclid(abs_step)) / abs_step };
    stop = start + numel * step;

    Ok((start, stop, step))
}

/// A `[start, stop)` strided view over another sequence.
///
/// Nested slices are flattened at construction: offsets and strides
/// compose, layers do not stack.
pub struct SliceView<S> {
    seq: S,
    start: i64,
    stop: i64,
    step: i64,
}

impl<S: Sequence> SliceView<S> {
    pub(crate) fn new(
        seq: S,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<Self> {
        let size = seq
            .len()
            .ok_or_else(|| SlipstreamError::invalid_index("cannot slice an unbounded sequence"))?;
        let (start, stop, step) = normalize_slice(start, stop, step, size)?;
        Ok(Self { seq, start, stop, step })
    }

    /// Slice this slice; composes into one descriptor over the original
    /// sequence instead of stacking a second layer.
    pub fn slice(
        self,
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    ) -> Result<SliceView<S>> {
        let size = Sequence::len(&self).unwrap_or(0);
        let (kstart, kstop, kstep) = normalize_slice(start, stop, step, size)?;
        let numel = (kstop - kstart).abs() / kstep.abs();
        let new_start = self.start + kstart * self.step;
        let new_step = kstep * self.step;
        let new_stop = new_start + new_step * numel;
        Ok(SliceView {
            seq: self.seq,
            start: new_start,
            stop: new_stop,
            step: new_step,
        })
    }

    /// Offset of this view's first item in the underlying sequence
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Stride of this view in the underlying sequence
    pub fn step(&self) -> i64 {
        self.step
    }
}

impl<S: Sequence> Sequence for SliceView<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        Some(((self.stop - self.start).abs() / self.step.abs()) as usize)
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())? as i64;
        self.seq.get(self.start + i * self.step)
    }
}

/// Arithmetic progression view with the semantics of the standard counting
/// range.
pub struct Arange {
    start: i64,
    stop: i64,
    step: i64,
}

/// Counting view over `start, start + step, …` up to (excluding) `stop`.
pub fn arange(start: i64, stop: i64, step: i64) -> Result<Arange> {
    if step == 0 {
        return Err(SlipstreamError::value_out_of_range("arange step cannot be 0"));
    }
    Ok(Arange { start, stop, step })
}

impl Sequence for Arange {
    type Item = i64;

    fn len(&self) -> Option<usize> {
        let span = self.stop - self.start;
        if span * self.step.signum() <= 0 {
            Some(0)
        } else {
            Some(((span.abs() + self.step.abs() - 1) / self.step.abs()) as usize)
        }
    }

    fn get(&self, index: i64) -> Result<i64> {
        let i = resolve_index(index, self.len())? as i64;
        Ok(self.start + i * self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_indexing() {
        let v = vec![10, 20, 30];
        assert_eq!(Sequence::len(&v), Some(3));
        assert_eq!(v.get(0).unwrap(), 10);
        assert_eq!(v.get(-1).unwrap(), 30);
        assert!(matches!(
            v.get(3),
            Err(SlipstreamError::IndexOutOfRange { index: 3, len: 3 })
        ));
        assert!(v.get(-4).is_err());
    }

    #[test]
    fn test_iteration() {
        let v = vec![1, 2, 3, 4];
        let collected: Result<Vec<_>> = v.items().collect();
        assert_eq!(collected.unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_arange() {
        let a = arange(0, 10, 3).unwrap();
        assert_eq!(Sequence::len(&a), Some(4));
        let items: Result<Vec<_>> = a.items().collect();
        assert_eq!(items.unwrap(), vec![0, 3, 6, 9]);

        let empty = arange(5, 5, 1).unwrap();
        assert_eq!(Sequence::len(&empty), Some(0));

        let down = arange(5, 0, -2).unwrap();
        let items: Result<Vec<_>> = down.items().collect();
        assert_eq!(items.unwrap(), vec![5, 3, 1]);

        assert!(arange(0, 1, 0).is_err());
    }

    #[test]
    fn test_slice_basic() {
        let v: Vec<i64> = (0..10).collect();
        let s = v.clone().slice(Some(2), Some(8), Some(2)).unwrap();
        assert_eq!(Sequence::len(&s), Some(3));
        let items: Result<Vec<_>> = s.items().collect();
        assert_eq!(items.unwrap(), vec![2, 4, 6]);

        let tail = v.clone().slice(Some(-3), None, None).unwrap();
        let items: Result<Vec<_>> = tail.items().collect();
        assert_eq!(items.unwrap(), vec![7, 8, 9]);

        // starting at or past the end yields an empty view
        let past = v.clone().slice(Some(10), None, None).unwrap();
        assert_eq!(Sequence::len(&past), Some(0));
        let past = v.clone().slice(Some(12), None, None).unwrap();
        assert_eq!(Sequence::len(&past), Some(0));

        let rev = v.slice(None, None, Some(-1)).unwrap();
        let items: Result<Vec<_>> = rev.items().collect();
        assert_eq!(items.unwrap(), (0..10).rev().collect::<Vec<_>>());
    }

    #[test]
    fn test_nested_slices_flatten() {
        let v: Vec<i64> = (0..100).collect();
        let a = v.slice(Some(10), Some(90), Some(2)).unwrap(); // 10, 12, .. 88
        let b = a.slice(Some(5), Some(30), Some(3)).unwrap(); // one layer, composed
        assert_eq!(b.start(), 20);
        assert_eq!(b.step(), 6);
        let items: Result<Vec<_>> = b.items().collect();
        let expected: Vec<i64> = (0..100).collect::<Vec<_>>()[10..90]
            .iter()
            .step_by(2)
            .copied()
            .collect::<Vec<_>>()[5..30]
            .iter()
            .step_by(3)
            .copied()
            .collect();
        assert_eq!(items.unwrap(), expected);
    }

    #[test]
    fn test_slice_of_empty() {
        let v: Vec<i64> = Vec::new();
        let s = v.slice(None, None, None).unwrap();
        assert_eq!(Sequence::len(&s), Some(0));
    }

    #[test]
    fn test_normalize_slice_rounds_stop() {
        let (start, stop, step) = normalize_slice(Some(0), Some(10), Some(3), 10).unwrap();
        assert_eq!((start, step), (0, 3));
        assert_eq!((stop - start) % step, 0);
        assert_eq!((stop - start) / step, 4);
    }
}

#[cfg(test)]
mod law_tests {
    use super::*;
    use proptest::prelude::*;

    fn collect<S: Sequence>(s: &S) -> Vec<S::Item> {
        s.items().collect::<Result<Vec<_>>>().unwrap()
    }

    proptest! {
        #[test]
        fn gather_of_gather_composes(
            base in proptest::collection::vec(any::<i32>(), 1..40),
            a_raw in proptest::collection::vec(0usize..100, 1..40),
            b_raw in proptest::collection::vec(0usize..100, 0..40),
        ) {
            let a: Vec<i64> = a_raw.iter().map(|&i| (i % base.len()) as i64).collect();
            let b: Vec<i64> = b_raw.iter().map(|&i| (i % a.len()) as i64).collect();

            let nested = gather(base.clone(), a.clone()).gather(b.clone()).unwrap();
            let composed: Vec<i64> = b.iter().map(|&j| a[j as usize]).collect();
            let flat = gather(base, composed);

            prop_assert_eq!(collect(&nested), collect(&flat));
        }

        #[test]
        fn slice_of_slice_is_one_flattened_slice(
            len in 1usize..60,
            a in (-70i64..70, proptest::option::of(-70i64..70), -3i64..4),
            b in (-70i64..70, proptest::option::of(-70i64..70), -3i64..4),
        ) {
            prop_assume!(a.2 != 0 && b.2 != 0);
            let data: Vec<i64> = (0..len as i64).collect();

            let outer = data.clone().slice(Some(a.0), a.1, Some(a.2)).unwrap();
            let expected: Vec<i64> = collect(&outer);
            let inner = outer.slice(Some(b.0), b.1, Some(b.2)).unwrap();

            // reference: slice the materialized outer view
            let reference = expected.slice(Some(b.0), b.1, Some(b.2)).unwrap();
            prop_assert_eq!(collect(&inner), collect(&reference));
        }

        #[test]
        fn cycle_reads_modulo_source(
            base in proptest::collection::vec(any::<i16>(), 1..20),
            limit in 1usize..100,
            probes in proptest::collection::vec(0usize..100, 1..20),
        ) {
            let cycled = indexing::cycle(base.clone(), Some(limit)).unwrap();
            for p in probes {
                if p < limit {
                    prop_assert_eq!(cycled.get(p as i64).unwrap(), base[p % base.len()]);
                }
            }
        }

        #[test]
        fn batch_then_unbatch_is_identity(
            data in proptest::collection::vec(any::<i32>(), 1..80),
            k in 1usize..10,
        ) {
            let batched = shape::batch(data.clone(), k, false, None).unwrap();
            let blocks = collect(&batched);
            let last_k = blocks.last().map_or(k, Vec::len);
            let flat = shape::unbatch(blocks, k, Some(last_k)).unwrap();
            prop_assert_eq!(collect(&flat), data);
        }

        #[test]
        fn concatenate_merge_equals_layered(
            parts in proptest::collection::vec(
                proptest::collection::vec(any::<i32>(), 0..10), 1..6),
            more in proptest::collection::vec(
                proptest::collection::vec(any::<i32>(), 0..10), 1..6),
        ) {
            let a = shape::concatenate(parts.clone()).unwrap();
            let b = shape::concatenate(more.clone()).unwrap();
            let merged = shape::Concatenated::merge(vec![a, b]).unwrap();

            let mut expected: Vec<i32> = parts.into_iter().flatten().collect();
            expected.extend(more.into_iter().flatten());
            prop_assert_eq!(collect(&merged), expected);
        }
    }
}
