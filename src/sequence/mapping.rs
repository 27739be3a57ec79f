//! On-demand mapping views
//!
//! Mapping is strictly lazy: `f` runs on every read, nothing is memoized.
//! Use [`crate::sequence::caching::add_cache`] on top when repeated reads of
//! the same item are expected.

use std::backtrace::Backtrace;
use std::sync::Arc;

use crate::error::{ raise_evaluation, BoxError, FailureCause, Result };
use crate::sequence::{ resolve_index, Sequence };

/// Lazy mapping of an infallible function over a sequence
pub struct Mapped<S, F> {
    seq: S,
    f: F,
}

/// Returns a view mapping `f` over `seq`.
///
/// Equivalent to `seq.items().map(f)` with random access and on-demand
/// evaluation.
pub fn smap<S, O, F>(f: F, seq: S) -> Mapped<S, F> where S: Sequence, F: Fn(S::Item) -> O {
    Mapped { seq, f }
}

impl<S, O, F> Sequence for Mapped<S, F> where S: Sequence, F: Fn(S::Item) -> O {
    type Item = O;

    fn len(&self) -> Option<usize> {
        self.seq.len()
    }

    fn get(&self, index: i64) -> Result<O> {
        let value = self.seq.get(index)?;
        Ok((self.f)(value))
    }
}

/// Lazy mapping of a fallible function over a sequence.
///
/// The backtrace of the construction site is captured so that failures
/// reported from a prefetch worker can point back at the pipeline
/// definition rather than at worker internals.
pub struct TryMapped<S, F> {
    seq: S,
    f: F,
    site: Arc<Backtrace>,
}

/// Returns a view mapping the fallible `f` over `seq`.
///
/// Failures of `f` are surfaced according to the thread's
/// [`crate::error::ErrorMode`]: wrapped with the failing index and this
/// call site, or passed through untouched.
pub fn try_smap<S, O, F>(f: F, seq: S) -> TryMapped<S, F>
    where S: Sequence, F: Fn(S::Item) -> std::result::Result<O, BoxError>
{
    TryMapped {
        seq,
        f,
        site: Arc::new(Backtrace::capture()),
    }
}

impl<S, O, F> Sequence for TryMapped<S, F>
    where S: Sequence, F: Fn(S::Item) -> std::result::Result<O, BoxError>
{
    type Item = O;

    fn len(&self) -> Option<usize> {
        self.seq.len()
    }

    fn get(&self, index: i64) -> Result<O> {
        let i = resolve_index(index, self.seq.len())? as i64;
        let value = self.seq.get(i)?;
        (self.f)(value).map_err(|e| {
            raise_evaluation(i, FailureCause::Original(e), Some(self.site.clone()))
        })
    }
}

/// Pairing of two sequences; the shorter input bounds the length
pub struct Zipped<A, B> {
    a: A,
    b: B,
}

/// Returns a view pairing `a` and `b` item by item.
///
/// The length is the shorter of the two inputs, so mapping a function of
/// several arguments is `smap` over a zip.
pub fn zip<A: Sequence, B: Sequence>(a: A, b: B) -> Zipped<A, B> {
    Zipped { a, b }
}

impl<A: Sequence, B: Sequence> Sequence for Zipped<A, B> {
    type Item = (A::Item, B::Item);

    fn len(&self) -> Option<usize> {
        match (self.a.len(), self.b.len()) {
            (Some(x), Some(y)) => Some(x.min(y)),
            (Some(x), None) | (None, Some(x)) => Some(x),
            (None, None) => None,
        }
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.len())? as i64;
        Ok((self.a.get(i)?, self.b.get(i)?))
    }
}

/// Like [`smap`] for a sequence of pairs, unpacking each pair into the
/// arguments of `f`.
pub fn starmap<S, A, B, O, F>(f: F, seq: S) -> Mapped<S, impl Fn((A, B)) -> O>
    where S: Sequence<Item = (A, B)>, F: Fn(A, B) -> O
{
    smap(move |(a, b)| f(a, b), seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SlipstreamError;
    use crate::sequence::SequenceExt;

    #[test]
    fn test_smap_is_lazy_and_on_demand() {
        use std::sync::atomic::{ AtomicUsize, Ordering };
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();

        let m = smap(
            move |x: i64| {
                calls2.fetch_add(1, Ordering::Relaxed);
                x + 1
            },
            vec![1i64, 2, 3, 4]
        );

        assert_eq!(calls.load(Ordering::Relaxed), 0);
        assert_eq!(m.get(2).unwrap(), 4);
        assert_eq!(m.get(2).unwrap(), 4); // recomputed, not memoized
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_smap_negative_index() {
        let m = vec![1i64, 2, 3].smap(|x| x * 10);
        assert_eq!(m.get(-1).unwrap(), 30);
    }

    #[test]
    fn test_try_smap_wraps_failures() {
        let m = vec![0i64, 1, 2].try_smap(|x| {
            if x == 1 { Err("bad item".into()) } else { Ok(x) }
        });
        assert_eq!(m.get(0).unwrap(), 0);
        match m.get(1) {
            Err(SlipstreamError::Evaluation(e)) => {
                assert_eq!(e.index(), 1);
                assert!(e.to_string().contains("bad item"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_zip_takes_shortest() {
        let z = zip(vec![1, 2, 3, 4], vec!["a", "b", "c"]);
        assert_eq!(Sequence::len(&z), Some(3));
        assert_eq!(z.get(1).unwrap(), (2, "b"));
        assert!(z.get(3).is_err());
    }

    #[test]
    fn test_starmap() {
        let pairs = vec![(1i64, 2i64), (3, 4)];
        let sums = starmap(|a, b| a + b, pairs);
        assert_eq!(sums.get(0).unwrap(), 3);
        assert_eq!(sums.get(1).unwrap(), 7);
    }
}
