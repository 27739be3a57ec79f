//! Shape-changing views: collate, concatenate, batch, unbatch, split

use tracing::warn;

use crate::error::{ Result, SlipstreamError };
use crate::sequence::{ resolve_index, Sequence, SliceView };

/// Item-wise pasting of several sequences of equal length
pub struct Collated<S> {
    seqs: Vec<S>,
}

/// Returns a view where item `i` is the vector of the `i`-th items of every
/// input.
///
/// All inputs must be finite and of the same length; mixed-type pasting is
/// done with [`crate::sequence::mapping::zip`] instead.
pub fn collate<S: Sequence>(seqs: Vec<S>) -> Result<Collated<S>> {
    if seqs.is_empty() {
        return Err(SlipstreamError::config("collate needs at least one input"));
    }
    let expected = seqs[0]
        .len()
        .ok_or_else(|| SlipstreamError::value_out_of_range("cannot collate unbounded sequences"))?;
    for s in &seqs[1..] {
        let actual = s
            .len()
            .ok_or_else(|| {
                SlipstreamError::value_out_of_range("cannot collate unbounded sequences")
            })?;
        if actual != expected {
            return Err(SlipstreamError::LengthMismatch { expected, actual });
        }
    }
    Ok(Collated { seqs })
}

impl<S: Sequence> Sequence for Collated<S> {
    type Item = Vec<S::Item>;

    fn len(&self) -> Option<usize> {
        self.seqs[0].len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())? as i64;
        self.seqs.iter().map(|s| s.get(i)).collect()
    }
}

/// End-to-end chaining of several sequences
pub struct Concatenated<S> {
    seqs: Vec<S>,
    offsets: Vec<usize>,
}

/// Returns a view chaining the inputs end to end.
///
/// Reads locate the source through a prefix-sum binary search.
pub fn concatenate<S: Sequence>(seqs: Vec<S>) -> Result<Concatenated<S>> {
    let mut offsets = Vec::with_capacity(seqs.len() + 1);
    offsets.push(0usize);
    for s in &seqs {
        let n = s.len().ok_or_else(|| {
            SlipstreamError::value_out_of_range("cannot concatenate unbounded sequences")
        })?;
        offsets.push(offsets[offsets.len() - 1] + n);
    }
    Ok(Concatenated { seqs, offsets })
}

impl<S: Sequence> Concatenated<S> {
    /// Chain several concatenations into one flat view; parts are spliced
    /// rather than stacked as an extra layer.
    pub fn merge(parts: Vec<Concatenated<S>>) -> Result<Concatenated<S>> {
        let seqs: Vec<S> = parts.into_iter().flat_map(|p| p.seqs).collect();
        concatenate(seqs)
    }
}

impl<S: Sequence> Sequence for Concatenated<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        Some(self.offsets[self.offsets.len() - 1])
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        let s = self.offsets.partition_point(|&o| o <= i) - 1;
        self.seqs[s].get((i - self.offsets[s]) as i64)
    }
}

/// Grouping of a sequence in blocks of `k` items
pub struct Batched<S: Sequence> {
    seq: S,
    k: usize,
    drop_last: bool,
    pad: Option<S::Item>,
}

/// Returns a view of `seq` in groups of `k` items.
///
/// When the last group is short it is dropped (`drop_last`), padded up to
/// `k` with `pad` when one is given, or returned short otherwise.
pub fn batch<S: Sequence>(
    seq: S,
    k: usize,
    drop_last: bool,
    pad: Option<S::Item>,
) -> Result<Batched<S>> {
    if k == 0 {
        return Err(SlipstreamError::value_out_of_range("batch size must be at least 1"));
    }
    if drop_last && pad.is_some() {
        warn!("batch pad value is ignored because drop_last is set");
    }
    Ok(Batched { seq, k, drop_last, pad })
}

impl<S: Sequence> Sequence for Batched<S> where S::Item: Clone {
    type Item = Vec<S::Item>;

    fn len(&self) -> Option<usize> {
        let n = self.seq.len()?;
        if n % self.k > 0 && !self.drop_last {
            Some(n / self.k + 1)
        } else {
            Some(n / self.k)
        }
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        let start = i * self.k;
        let stop = match self.seq.len() {
            Some(n) => (start + self.k).min(n),
            None => start + self.k,
        };

        let mut out = Vec::with_capacity(self.k);
        for j in start..stop {
            out.push(self.seq.get(j as i64)?);
        }
        if out.len() < self.k && !self.drop_last {
            if let Some(pad) = &self.pad {
                out.resize(self.k, pad.clone());
            }
        }
        Ok(out)
    }
}

/// Flattening of a sequence of batches
pub struct Unbatched<S> {
    seq: S,
    k: usize,
    last_k: usize,
}

/// Recomposes a flat view out of a sequence of batches of size `k`, the
/// last one possibly shorter (`last_k`).
pub fn unbatch<S>(seq: S, k: usize, last_k: Option<usize>) -> Result<Unbatched<S>>
    where S: Sequence, S::Item: Sequence
{
    if k == 0 {
        return Err(SlipstreamError::value_out_of_range("batch size must be at least 1"));
    }
    let last_k = last_k.unwrap_or(k);
    if last_k == 0 || last_k > k {
        return Err(
            SlipstreamError::value_out_of_range(format!(
                "last batch size must be in 1..={k}, got {last_k}"
            ))
        );
    }
    Ok(Unbatched { seq, k, last_k })
}

impl<S> Sequence for Unbatched<S> where S: Sequence, S::Item: Sequence {
    type Item = <S::Item as Sequence>::Item;

    fn len(&self) -> Option<usize> {
        let n = self.seq.len()?;
        if n == 0 {
            Some(0)
        } else {
            Some((n - 1) * self.k + self.last_k)
        }
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        let block = self.seq.get((i / self.k) as i64)?;
        block.get((i % self.k) as i64)
    }
}

/// How [`split`] cuts a sequence
pub enum Edges {
    /// Cut into this many chunks of equal size; must divide the length
    Count(usize),
    /// Cut at these positions; begin and end are implicit
    Cuts(Vec<usize>),
    /// Explicit `(start, stop)` pairs; out-of-range bounds are clipped
    Bounds(Vec<(usize, usize)>),
}

/// Succession of contiguous subsequence views
pub struct SplitSeq<S> {
    seq: S,
    bounds: Vec<(usize, usize)>,
}

fn clip(x: usize, lo: usize, hi: usize) -> usize {
    x.max(lo).min(hi)
}

/// Splits a finite sequence into a succession of subsequence views.
pub fn split<S: Sequence + Clone>(seq: S, edges: Edges) -> Result<SplitSeq<S>> {
    let n = seq
        .len()
        .ok_or_else(|| SlipstreamError::value_out_of_range("cannot split an unbounded sequence"))?;

    let bounds = match edges {
        Edges::Count(chunks) => {
            if chunks == 0 || n % chunks != 0 {
                return Err(
                    SlipstreamError::value_out_of_range(format!(
                        "number of chunks ({chunks}) must divide the sequence length ({n})"
                    ))
                );
            }
            let step = n / chunks;
            (0..chunks).map(|i| (i * step, (i + 1) * step)).collect()
        }
        Edges::Cuts(cuts) => {
            let mut bounds: Vec<(usize, usize)> = Vec::with_capacity(cuts.len() + 1);
            for cut in cuts {
                let start = bounds.last().map_or(0, |b| b.1);
                bounds.push((clip(start, 0, n.saturating_sub(1)), clip(cut, 0, n)));
            }
            let start = bounds.last().map_or(0, |b| b.1);
            bounds.push((start, n));
            bounds
        }
        Edges::Bounds(pairs) => pairs
            .into_iter()
            .map(|(start, stop)| (clip(start, 0, n.saturating_sub(1)), clip(stop, 0, n)))
            .collect(),
    };

    Ok(SplitSeq { seq, bounds })
}

impl<S: Sequence + Clone> Sequence for SplitSeq<S> {
    type Item = SliceView<S>;

    fn len(&self) -> Option<usize> {
        Some(self.bounds.len())
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        let (start, stop) = self.bounds[i];
        SliceView::new(self.seq.clone(), Some(start as i64), Some(stop as i64), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::SequenceExt;

    fn collect<S: Sequence>(s: &S) -> Vec<S::Item> {
        s.items().collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_collate() {
        let c = collate(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]).unwrap();
        assert_eq!(c.get(1).unwrap(), vec![2, 5, 8]);
        assert_eq!(Sequence::len(&c), Some(3));
    }

    #[test]
    fn test_collate_length_mismatch() {
        let res = collate(vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(matches!(
            res.err(),
            Some(SlipstreamError::LengthMismatch { expected: 3, actual: 2 })
        ));
    }

    #[test]
    fn test_concatenate() {
        let c = concatenate(vec![vec![1, 2], Vec::new(), vec![3], vec![4, 5]]).unwrap();
        assert_eq!(Sequence::len(&c), Some(5));
        assert_eq!(collect(&c), vec![1, 2, 3, 4, 5]);
        assert_eq!(c.get(-1).unwrap(), 5);
    }

    #[test]
    fn test_concatenate_merge_flattens() {
        let a = concatenate(vec![vec![1], vec![2, 3]]).unwrap();
        let b = concatenate(vec![vec![4, 5]]).unwrap();
        let merged = Concatenated::merge(vec![a, b]).unwrap();
        assert_eq!(collect(&merged), vec![1, 2, 3, 4, 5]);
        // spliced into one layer: four source sequences, one offset table
        assert_eq!(merged.offsets, vec![0, 1, 3, 5]);
    }

    #[test]
    fn test_batch_short_last() {
        let b = (0..7).collect::<Vec<i64>>().batch(3, false, None).unwrap();
        assert_eq!(Sequence::len(&b), Some(3));
        assert_eq!(b.get(2).unwrap(), vec![6]);
    }

    #[test]
    fn test_batch_drop_last() {
        let b = (0..7).collect::<Vec<i64>>().batch(3, true, None).unwrap();
        assert_eq!(Sequence::len(&b), Some(2));
        assert_eq!(b.get(1).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_batch_pad() {
        let b = (0..7).collect::<Vec<i64>>().batch(3, false, Some(-1)).unwrap();
        assert_eq!(b.get(2).unwrap(), vec![6, -1, -1]);
    }

    #[test]
    fn test_unbatch_inverts_batch() {
        let data: Vec<i64> = (0..10).collect();
        let batched = data.clone().batch(3, false, None).unwrap();
        let blocks = collect(&batched);
        let last_k = blocks[blocks.len() - 1].len();
        let flat = unbatch(blocks, 3, Some(last_k)).unwrap();
        assert_eq!(Sequence::len(&flat), Some(10));
        assert_eq!(collect(&flat), data);
    }

    #[test]
    fn test_split_count() {
        let s = (0..12).collect::<Vec<i64>>().split(Edges::Count(3)).unwrap();
        assert_eq!(Sequence::len(&s), Some(3));
        let mid = s.get(1).unwrap();
        assert_eq!(collect(&mid), vec![4, 5, 6, 7]);

        assert!((0..10).collect::<Vec<i64>>().split(Edges::Count(3)).is_err());
    }

    #[test]
    fn test_split_cuts() {
        let s = (0..10).collect::<Vec<i64>>().split(Edges::Cuts(vec![2, 7])).unwrap();
        assert_eq!(Sequence::len(&s), Some(3));
        assert_eq!(collect(&s.get(0).unwrap()), vec![0, 1]);
        assert_eq!(collect(&s.get(1).unwrap()), vec![2, 3, 4, 5, 6]);
        assert_eq!(collect(&s.get(2).unwrap()), vec![7, 8, 9]);
    }

    #[test]
    fn test_split_bounds_are_clipped() {
        let s = (0..10)
            .collect::<Vec<i64>>()
            .split(Edges::Bounds(vec![(0, 4), (4, 25)]))
            .unwrap();
        assert_eq!(collect(&s.get(1).unwrap()), vec![4, 5, 6, 7, 8, 9]);
    }
}
