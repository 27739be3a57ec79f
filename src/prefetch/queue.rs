//! Fixed-record MPMC queue over shared memory
//!
//! Carries the parent-to-worker job messages. Records have a fixed binary
//! layout so the hot path never allocates or serializes; blocking is done
//! with process-shared semaphores and the head/tail counters are guarded
//! by process-shared mutexes, one per queue end.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use static_assertions::const_assert_eq;

use crate::constants::JOB_MSG_SIZE;
use crate::error::Result;
use crate::prefetch::shm::{
    mutex_init_shared,
    sem_init_shared,
    sem_post,
    sem_wait_timeout,
    with_mutex,
    ShmRegion,
};

/// Job record sent to workers.
///
/// `slot < 0` is the terminate sentinel; `arena < 0` means no
/// shared-memory slot was assigned and the result must come back
/// serialized.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct JobMsg {
    /// Index of the item to evaluate
    pub index: i64,
    /// In-flight ring slot the result belongs to
    pub slot: i32,
    /// Arena slot assigned for packed transport, or -1
    pub arena: i32,
}

const_assert_eq!(mem::size_of::<JobMsg>(), JOB_MSG_SIZE);

impl JobMsg {
    pub fn terminate() -> Self {
        Self { index: 0, slot: -1, arena: -1 }
    }

    pub fn is_terminate(&self) -> bool {
        self.slot < 0
    }
}

#[repr(C)]
struct QueueHeader {
    put_sem: libc::sem_t,
    get_sem: libc::sem_t,
    head_lock: libc::pthread_mutex_t,
    tail_lock: libc::pthread_mutex_t,
    head: u64,
    tail: u64,
}

/// Bounded MPMC queue of `Copy` records in a shared mapping.
///
/// Clones share the same region; the queue survives a fork and both sides
/// of the boundary may push and pop concurrently.
pub(crate) struct ShmQueue<T: Copy> {
    region: Arc<ShmRegion>,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> Clone for ShmQueue<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            capacity: self.capacity,
            _marker: PhantomData,
        }
    }
}

fn records_offset() -> usize {
    (mem::size_of::<QueueHeader>() + 7) & !7
}

impl<T: Copy> ShmQueue<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        assert!(capacity > 0);
        let len = records_offset() + capacity * mem::size_of::<T>();
        let region = Arc::new(ShmRegion::new(len)?);

        let header = region.as_ptr() as *mut QueueHeader;
        unsafe {
            sem_init_shared(ptr::addr_of_mut!((*header).put_sem), capacity as u32)?;
            sem_init_shared(ptr::addr_of_mut!((*header).get_sem), 0)?;
            mutex_init_shared(ptr::addr_of_mut!((*header).head_lock))?;
            mutex_init_shared(ptr::addr_of_mut!((*header).tail_lock))?;
        }

        Ok(Self { region, capacity, _marker: PhantomData })
    }

    fn header(&self) -> *mut QueueHeader {
        self.region.as_ptr() as *mut QueueHeader
    }

    fn record_ptr(&self, pos: usize) -> *mut T {
        unsafe {
            self.region
                .as_ptr()
                .add(records_offset() + pos * mem::size_of::<T>()) as *mut T
        }
    }

    /// Push a record, blocking while the queue is full.
    pub fn put(&self, value: T) -> Result<()> {
        let header = self.header();
        unsafe {
            sem_wait_timeout(ptr::addr_of_mut!((*header).put_sem), None)?;
            with_mutex(ptr::addr_of_mut!((*header).tail_lock), || {
                let pos = ((*header).tail % self.capacity as u64) as usize;
                ptr::write(self.record_ptr(pos), value);
                (*header).tail += 1;
            })?;
            sem_post(ptr::addr_of_mut!((*header).get_sem))?;
        }
        Ok(())
    }

    /// Pop a record, waiting at most `timeout`; `None` on timeout.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let header = self.header();
        unsafe {
            if !sem_wait_timeout(ptr::addr_of_mut!((*header).get_sem), timeout)? {
                return Ok(None);
            }
            let value = with_mutex(ptr::addr_of_mut!((*header).head_lock), || {
                let pos = ((*header).head % self.capacity as u64) as usize;
                let value = ptr::read(self.record_ptr(pos));
                (*header).head += 1;
                value
            })?;
            sem_post(ptr::addr_of_mut!((*header).put_sem))?;
            Ok(Some(value))
        }
    }

    /// Pop a record if one is immediately available.
    pub fn try_get(&self) -> Result<Option<T>> {
        self.get(Some(Duration::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_job_msg_sentinel() {
        assert!(JobMsg::terminate().is_terminate());
        assert!(!JobMsg { index: 1, slot: 0, arena: -1 }.is_terminate());
    }

    #[test]
    fn test_put_get_fifo() {
        let q: ShmQueue<JobMsg> = ShmQueue::new(4).unwrap();
        for i in 0..4 {
            q.put(JobMsg { index: i, slot: i as i32, arena: -1 }).unwrap();
        }
        for i in 0..4 {
            let msg = q.get(Some(Duration::from_millis(100))).unwrap().unwrap();
            assert_eq!(msg.index, i);
        }
        assert!(q.try_get().unwrap().is_none());
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let q: ShmQueue<JobMsg> = ShmQueue::new(2).unwrap();
        let start = std::time::Instant::now();
        assert!(q.get(Some(Duration::from_millis(50))).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_threaded_producers_and_consumers() {
        let q: ShmQueue<JobMsg> = ShmQueue::new(8).unwrap();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        q.put(JobMsg { index: p * 1000 + i, slot: 0, arena: -1 }).unwrap();
                    }
                })
            })
            .collect();

        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                for _ in 0..400 {
                    let msg = q.get(Some(Duration::from_secs(5))).unwrap().unwrap();
                    seen.push(msg.index);
                }
                seen
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut seen = consumer.join().unwrap();
        seen.sort_unstable();
        let mut expected: Vec<i64> = (0..4)
            .flat_map(|p| (0..100).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
