//! Random access over one-shot iterables

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{ Result, SlipstreamError };
use crate::sequence::{ resolve_index, Sequence };

/// Indexable view over a restartable iterator.
///
/// Keeps `n_parallel` independent cursors over fresh iterators from
/// `make_iter`, each holding a FIFO cache of its last `cache_size` items.
/// A read lands on the cursor that can serve it cheapest; a read below the
/// position of every cursor restarts the one that is furthest behind.
///
/// Intended for consumer-thread access only; the cursors live behind one
/// mutex and concurrent readers would serialize on it anyway.
pub struct Uniter<F, I: Iterator> {
    make_iter: F,
    size: Option<usize>,
    cache_size: usize,
    cursors: Mutex<Vec<Cursor<I>>>,
}

struct Cursor<I: Iterator> {
    iter: I,
    /// next position this cursor will yield
    pos: usize,
    /// `(position, value)` of the most recently yielded items
    cache: VecDeque<(usize, I::Item)>,
}

impl<I: Iterator> Cursor<I> {
    fn lookup(&self, target: usize) -> Option<&I::Item> {
        self.cache
            .iter()
            .find(|(pos, _)| *pos == target)
            .map(|(_, v)| v)
    }

    fn advance_to(&mut self, target: usize, cache_size: usize) -> Result<()> {
        while self.pos <= target {
            let value = self.iter.next().ok_or(SlipstreamError::IndexOutOfRange {
                index: target as i64,
                len: self.pos,
            })?;
            if self.cache.len() >= cache_size {
                self.cache.pop_front();
            }
            self.cache.push_back((self.pos, value));
            self.pos += 1;
        }
        Ok(())
    }
}

/// Makes an indexable sequence out of a one-shot iterable.
///
/// `make_iter` must produce a fresh iterator with identical content on
/// every call; `size` bounds the view when known and leaves it unbounded
/// otherwise.
pub fn uniter<F, I>(make_iter: F, cache_size: usize, n_parallel: usize, size: Option<usize>) -> Uniter<F, I>
    where F: Fn() -> I, I: Iterator
{
    let n_parallel = n_parallel.max(1);
    let cursors = (0..n_parallel)
        .map(|_| Cursor {
            iter: make_iter(),
            pos: 0,
            cache: VecDeque::new(),
        })
        .collect();
    Uniter {
        make_iter,
        size,
        cache_size: cache_size.max(1),
        cursors: Mutex::new(cursors),
    }
}

impl<F, I> Sequence for Uniter<F, I> where F: Fn() -> I, I: Iterator, I::Item: Clone {
    type Item = I::Item;

    fn len(&self) -> Option<usize> {
        self.size
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let target = resolve_index(index, self.size)?;
        let mut cursors = self.cursors.lock();

        // served from a cache?
        for cursor in cursors.iter() {
            if let Some(value) = cursor.lookup(target) {
                return Ok(value.clone());
            }
        }

        // otherwise advance the closest cursor below the target, or restart
        // the one that is furthest behind
        let candidate = cursors
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pos <= target)
            .max_by_key(|(_, c)| c.pos)
            .map(|(k, _)| k);
        let k = match candidate {
            Some(k) => k,
            None => {
                let k = cursors
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| c.pos)
                    .map(|(k, _)| k)
                    .expect("uniter keeps at least one cursor");
                cursors[k] = Cursor {
                    iter: (self.make_iter)(),
                    pos: 0,
                    cache: VecDeque::new(),
                };
                k
            }
        };

        cursors[k].advance_to(target, self.cache_size)?;
        let value = cursors[k]
            .lookup(target)
            .expect("cursor advanced past the target")
            .clone();
        Ok(value)
    }
}
