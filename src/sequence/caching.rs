//! Small thread-safe cache over a sequence

use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::Result;
use crate::sequence::{ resolve_index, SeqIter, Sequence, SequenceExt };

/// Sequence wrapped with a least-recently-used cache.
///
/// Holds clones of the most recently read items behind a single mutex.
/// Useful when consumers re-read nearby items, e.g. overlapping batches.
pub struct CachedSeq<S: Sequence> {
    seq: S,
    cache_size: usize,
    cache: Mutex<CacheState<S::Item>>,
}

struct CacheState<T> {
    values: HashMap<usize, T>,
    order: VecDeque<usize>,
}

/// Adds a caching mechanism over a sequence.
///
/// At most `cache_size` items are retained; reads of cached indices return
/// a clone without re-triggering the upstream chain.
pub fn add_cache<S>(seq: S, cache_size: usize) -> CachedSeq<S>
    where S: Sequence, S::Item: Clone
{
    CachedSeq {
        seq,
        cache_size: cache_size.max(1),
        cache: Mutex::new(CacheState {
            values: HashMap::new(),
            order: VecDeque::new(),
        }),
    }
}

impl<S> CachedSeq<S> where S: Sequence, S::Item: Clone {
    /// Iterate the underlying sequence directly; a scan gets no reuse out
    /// of the cache, so it is bypassed.
    pub fn items(&self) -> SeqIter<'_, S> {
        self.seq.items()
    }
}

impl<S> Sequence for CachedSeq<S> where S: Sequence, S::Item: Clone {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        self.seq.len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.seq.len())?;

        let mut state = self.cache.lock();
        if let Some(value) = state.values.get(&i) {
            let value = value.clone();
            state.order.retain(|&k| k != i);
            state.order.push_back(i);
            return Ok(value);
        }

        let value = self.seq.get(i as i64)?;
        if state.values.len() >= self.cache_size {
            if let Some(evicted) = state.order.pop_front() {
                state.values.remove(&evicted);
            }
        }
        state.values.insert(i, value.clone());
        state.order.push_back(i);
        Ok(value)
    }
}
