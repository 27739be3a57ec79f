//! Index-rewriting views: gather, cycle, repeat, interleave

use crate::error::{ Result, SlipstreamError };
use crate::sequence::{ resolve_index, Sequence };

/// View reordered through an index array
pub struct Gathered<S> {
    seq: S,
    indices: Vec<i64>,
}

/// Returns a view on `seq` reordered by `indices`.
///
/// `get(i)` reads `seq.get(indices[i])`; indices may repeat and may be
/// negative (resolved against `seq` on every read).
pub fn gather<S: Sequence>(seq: S, indices: Vec<i64>) -> Gathered<S> {
    Gathered { seq, indices }
}

/// Alias for [`gather`].
pub fn take<S: Sequence>(seq: S, indices: Vec<i64>) -> Gathered<S> {
    gather(seq, indices)
}

impl<S: Sequence> Gathered<S> {
    /// Gather a gathered view; the index arrays compose into one layer
    /// over the original sequence.
    pub fn gather(self, indices: Vec<i64>) -> Result<Gathered<S>> {
        let len = self.indices.len();
        let composed = indices
            .into_iter()
            .map(|j| {
                let j = resolve_index(j, Some(len))?;
                Ok(self.indices[j])
            })
            .collect::<Result<Vec<i64>>>()?;
        Ok(Gathered { seq: self.seq, indices: composed })
    }
}

impl<S: Sequence> Sequence for Gathered<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        Some(self.indices.len())
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        self.seq.get(self.indices[i])
    }
}

/// Repetition of a sequence, bounded or not
pub struct Cycle<S> {
    seq: S,
    src_len: usize,
    limit: Option<usize>,
}

/// Returns a view repeating `seq`, up to `limit` items when given and
/// without bound otherwise.
///
/// The unbounded form rejects negative indices.
pub fn cycle<S: Sequence>(seq: S, limit: Option<usize>) -> Result<Cycle<S>> {
    let src_len = seq
        .len()
        .ok_or_else(|| SlipstreamError::value_out_of_range("cannot cycle an unbounded sequence"))?;
    if src_len == 0 {
        return Err(SlipstreamError::value_out_of_range("cannot cycle an empty sequence"));
    }
    Ok(Cycle { seq, src_len, limit })
}

impl<S: Sequence> Sequence for Cycle<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        self.limit
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        self.seq.get((i % self.src_len) as i64)
    }
}

/// Constant view repeating one value
pub struct Repeat<T> {
    value: T,
    times: Option<usize>,
}

/// Returns a view repeating `value`, `times` items when given and without
/// bound otherwise.
pub fn repeat<T: Clone>(value: T, times: Option<usize>) -> Repeat<T> {
    Repeat { value, times }
}

impl<T: Clone> Sequence for Repeat<T> {
    type Item = T;

    fn len(&self) -> Option<usize> {
        self.times
    }

    fn get(&self, index: i64) -> Result<T> {
        resolve_index(index, self.times)?;
        Ok(self.value.clone())
    }
}

/// Round-robin interleaving of several sequences.
///
/// As each input runs out it drops from the rotation, so inputs of unequal
/// lengths still contribute all of their items. Reads are O(log n) through
/// precomputed exhaustion offsets.
pub struct Interleaved<S> {
    seqs: Vec<S>,
    /// input position at which the k-th shortest sequence runs out
    offsets_in: Vec<usize>,
    /// output position at which the k-th shortest sequence runs out
    offsets_out: Vec<usize>,
    /// inputs still rotating once k sequences have run out
    remaining: Vec<Vec<usize>>,
}

/// Interleaves elements from several finite sequences into one.
pub fn interleave<S: Sequence>(seqs: Vec<S>) -> Result<Interleaved<S>> {
    let n = seqs.len();
    let mut lens = Vec::with_capacity(n);
    for s in &seqs {
        lens.push(
            s.len().ok_or_else(|| {
                SlipstreamError::value_out_of_range("cannot interleave unbounded sequences")
            })?
        );
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&k| lens[k]);

    let mut offsets_in = vec![0usize];
    let mut offsets_out = vec![0usize];
    for (rank, &i) in order.iter().enumerate() {
        let n_seqs_left = n - rank;
        let n_new_out = (lens[i] - offsets_in[offsets_in.len() - 1]) * n_seqs_left;
        offsets_out.push(offsets_out[offsets_out.len() - 1] + n_new_out);
        offsets_in.push(lens[i]);
    }

    let remaining = (0..n)
        .map(|k| {
            let mut left = order[k..].to_vec();
            left.sort_unstable();
            left
        })
        .collect();

    Ok(Interleaved { seqs, offsets_in, offsets_out, remaining })
}

impl<S: Sequence> Interleaved<S> {
    /// Map an output position to `(sequence, inner index)`
    fn convert(&self, key: usize) -> (usize, usize) {
        let n_exhausted = self.offsets_out.partition_point(|&o| o <= key) - 1;
        let n_remaining = self.seqs.len() - n_exhausted;
        let key = key - self.offsets_out[n_exhausted];
        let seq = self.remaining[n_exhausted][key % n_remaining];
        let idx = self.offsets_in[n_exhausted] + key / n_remaining;
        (seq, idx)
    }
}

impl<S: Sequence> Sequence for Interleaved<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        Some(self.offsets_out[self.offsets_out.len() - 1])
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())?;
        let (seq, idx) = self.convert(i);
        self.seqs[seq].get(idx as i64)
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
    fn test_gather() {
        let g = gather(vec![10, 20, 30, 40], vec![3, 0, 0, -1]);
        assert_eq!(collect(&g), vec![40, 10, 10, 40]);
        assert!(g.get(4).is_err());
    }

    #[test]
    fn test_nested_gathers_compose() {
        let base = vec![0i64, 10, 20, 30, 40, 50];
        let a = vec![5i64, 4, 3, 2, 1, 0];
        let b = vec![1i64, 1, 2, -1];

        let composed = gather(base.clone(), a.clone()).gather(b.clone()).unwrap();
        // law: gather(gather(s, a), b) == gather(s, a[b])
        let ab: Vec<i64> = b
            .iter()
            .map(|&j| {
                let j = if j < 0 { a.len() as i64 + j } else { j };
                a[j as usize]
            })
            .collect();
        let flat = gather(base, ab);
        assert_eq!(collect(&composed), collect(&flat));
    }

    #[test]
    fn test_cycle_finite() {
        let c = vec![1, 2, 3].cycle(Some(7)).unwrap();
        assert_eq!(Sequence::len(&c), Some(7));
        assert_eq!(collect(&c), vec![1, 2, 3, 1, 2, 3, 1]);
        assert_eq!(c.get(-1).unwrap(), 1);
    }

    #[test]
    fn test_cycle_unbounded() {
        let c = vec![1, 2, 3].cycle(None).unwrap();
        assert_eq!(Sequence::len(&c), None);
        assert_eq!(c.get(3000).unwrap(), 1);
        assert!(c.get(-1).is_err());
    }

    #[test]
    fn test_cycle_rejects_empty() {
        let empty: Vec<i64> = Vec::new();
        assert!(empty.cycle(Some(3)).is_err());
    }

    #[test]
    fn test_repeat() {
        let r = repeat("x", Some(3));
        assert_eq!(collect(&r), vec!["x", "x", "x"]);

        let unbounded = repeat(7, None);
        assert_eq!(Sequence::len(&unbounded), None);
        assert_eq!(unbounded.get(123456).unwrap(), 7);
    }

    #[test]
    fn test_interleave_drops_exhausted() {
        // the docstring example of the original: 1 a .1 2 b .2 3 c .3 4 .4 5
        let a = vec!["1", "2", "3", "4", "5"];
        let b = vec!["a", "b", "c"];
        let c = vec![".1", ".2", ".3", ".4"];
        let il = interleave(vec![a, b, c]).unwrap();
        assert_eq!(Sequence::len(&il), Some(12));
        assert_eq!(
            collect(&il),
            vec!["1", "a", ".1", "2", "b", ".2", "3", "c", ".3", "4", ".4", "5"]
        );
    }

    #[test]
    fn test_interleave_equal_lengths() {
        let il = interleave(vec![vec![1, 3, 5], vec![2, 4, 6]]).unwrap();
        assert_eq!(collect(&il), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_interleave_single() {
        let il = interleave(vec![vec![1, 2, 3]]).unwrap();
        assert_eq!(collect(&il), vec![1, 2, 3]);
    }
}
