//! Worker-backed prefetching of sequence items
//!
//! [`prefetch`] wraps the tail of a lazy pipeline with a pool of workers
//! that evaluate items ahead of consumption. The scheduler keeps a ring of
//! in-flight jobs, predicts the next accesses with an `anticipate`
//! function (`i + 1` by default) and translates sequential reads into an
//! O(1) amortized wait. Reads that break the prediction stay correct at
//! the cost of up to one ring of wasted work.
//!
//! Two backends are available: threads sharing the pipeline in-process,
//! and forked worker processes communicating over a shared-memory job
//! queue and per-worker result pipes, optionally with zero-copy transport
//! of buffer leaves through a shared-memory arena.
//!
//! ## Example
//!
//! ```rust,no_run
//! use slipstream::prefetch::{prefetch, PrefetchConfig};
//! use slipstream::sequence::{Sequence, SequenceExt};
//!
//! let pipeline = (0..10_000i64).collect::<Vec<_>>().smap(|x| x * x);
//! let fetched = prefetch(pipeline, PrefetchConfig::new().with_workers(4)).unwrap();
//! for item in fetched.items() {
//!     let _ = item.unwrap();
//! }
//! ```

pub mod arena;
pub mod backend;
pub mod pack;
pub mod process;
pub mod queue;
pub mod shm;
pub mod thread;

pub use arena::SlotView;
pub use pack::{ PackError, Packable, PackedNode, SlotWriter };

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::{ DEFAULT_MAX_BUFFERED, DEFAULT_WORKER_TIMEOUT, MIN_SHM_BUFFERED, SHM_RING_SLACK };
use crate::error::{ raise_evaluation, Result, SlipstreamError };
use crate::prefetch::backend::{ resolve_workers, AsyncBackend };
use crate::prefetch::process::ProcessBackend;
use crate::prefetch::thread::ThreadBackend;
use crate::sequence::{ resolve_index, Sequence };

/// Callback run by every worker right after it starts
pub type StartHook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Predictor mapping an index to the one most likely requested next
pub type Anticipate = Arc<dyn Fn(i64) -> i64 + Send + Sync + 'static>;

/// Worker pool flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Threads sharing the pipeline in-process; low overhead, best for
    /// I/O-bound stages
    Thread,
    /// Forked worker processes; full parallelism, results cross a process
    /// boundary (serialized, or zero-copy when an arena is configured)
    Process,
}

/// Configuration for [`prefetch`]
#[derive(Clone)]
pub struct PrefetchConfig {
    nworkers: i32,
    method: Method,
    max_buffered: usize,
    timeout: Duration,
    shm_size: usize,
    start_hook: Option<StartHook>,
    anticipate: Option<Anticipate>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            nworkers: 0,
            method: Method::Thread,
            max_buffered: DEFAULT_MAX_BUFFERED,
            timeout: DEFAULT_WORKER_TIMEOUT,
            shm_size: 0,
            start_hook: None,
            anticipate: None,
        }
    }
}

impl PrefetchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker count: positive values are exact, zero and negative ones
    /// spare that many cpu cores.
    pub fn with_workers(mut self, nworkers: i32) -> Self {
        self.nworkers = nworkers;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Size of the in-flight ring; also the number of arena slots under
    /// shared-memory transport.
    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    /// Idle time after which a worker goes to sleep (it is restarted on
    /// demand).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total bytes of the shared-memory arena; 0 disables zero-copy
    /// transport. Only meaningful with [`Method::Process`].
    pub fn with_shm_size(mut self, shm_size: usize) -> Self {
        self.shm_size = shm_size;
        self
    }

    /// Callback executed by every worker after spawn (seeding random
    /// state, opening connections, ...).
    pub fn with_start_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.start_hook = Some(Arc::new(hook));
        self
    }

    /// Predictor of the next requested index; defaults to `|i| i + 1`.
    pub fn with_anticipate(mut self, anticipate: impl Fn(i64) -> i64 + Send + Sync + 'static) -> Self {
        self.anticipate = Some(Arc::new(anticipate));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_buffered < 1 {
            return Err(SlipstreamError::config("max_buffered must be at least 1"));
        }
        if self.timeout == Duration::ZERO {
            return Err(SlipstreamError::config("worker timeout must be positive"));
        }
        if self.shm_size > 0 {
            if self.method != Method::Process {
                return Err(
                    SlipstreamError::config("shared-memory transport requires the process method")
                );
            }
            if self.max_buffered < MIN_SHM_BUFFERED {
                return Err(
                    SlipstreamError::config(format!(
                        "shared-memory transport needs max_buffered >= {MIN_SHM_BUFFERED}"
                    ))
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobStatus {
    Queued,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum FatalKind {
    WorkerDied,
    BufferExhausted,
    Internal,
}

impl FatalKind {
    fn of(error: &SlipstreamError) -> Option<Self> {
        match error {
            SlipstreamError::WorkerDied => Some(FatalKind::WorkerDied),
            SlipstreamError::BufferExhausted => Some(FatalKind::BufferExhausted),
            // a failed pipe read desyncs the completion stream for good
            SlipstreamError::System { .. } | SlipstreamError::Io(_) => Some(FatalKind::Internal),
            _ => None,
        }
    }

    fn to_error(self) -> SlipstreamError {
        match self {
            FatalKind::WorkerDied => SlipstreamError::WorkerDied,
            FatalKind::BufferExhausted => SlipstreamError::BufferExhausted,
            FatalKind::Internal => {
                SlipstreamError::system("pipeline poisoned by an earlier fatal error")
            }
        }
    }
}

struct Scheduler<T> {
    backend: Box<dyn AsyncBackend<Item = T> + Send>,
    /// which item each ring slot is supposed to compute
    todo: Vec<i64>,
    status: Vec<JobStatus>,
    /// slot holding the item the consumer expects next
    first_slot: usize,
    anticipate: Anticipate,
    fatal: Option<FatalKind>,
}

impl<T> Scheduler<T> {
    fn start_job(&mut self, slot: usize) -> Result<()> {
        self.backend.submit(self.todo[slot], slot)?;
        self.status[slot] = JobStatus::Queued;
        Ok(())
    }

    fn poison(&mut self, error: SlipstreamError) -> SlipstreamError {
        if self.fatal.is_none() {
            self.fatal = FatalKind::of(&error);
        }
        error
    }

    fn fetch(&mut self, item: i64, site: &Arc<Backtrace>) -> Result<T> {
        if let Some(kind) = self.fatal {
            return Err(kind.to_error());
        }
        let n = self.todo.len();

        // reads off the predicted path reassign the whole ring
        if item != self.todo[self.first_slot] {
            self.first_slot = 0;
            self.todo[0] = item;
            for k in 1..n {
                self.todo[k] = (self.anticipate)(self.todo[k - 1]);
            }
            for k in 0..n {
                if self.status[k] != JobStatus::Queued {
                    if let Err(e) = self.start_job(k) {
                        return Err(self.poison(e));
                    }
                }
            }
        }

        // drain completions until the wanted slot resolves; stale results
        // (from slots reassigned while their job ran) are discarded and
        // the slot resubmitted under its current target
        while self.status[self.first_slot] == JobStatus::Queued {
            let (index, slot, failed) = match self.backend.next_completion() {
                Ok(completion) => completion,
                Err(e) => {
                    return Err(self.poison(e));
                }
            };
            if index != self.todo[slot] {
                if let Err(e) = self.start_job(slot) {
                    return Err(self.poison(e));
                }
            } else {
                self.status[slot] = if failed { JobStatus::Failed } else { JobStatus::Done };
            }
        }

        let slot = self.first_slot;
        self.first_slot = (self.first_slot + 1) % n;

        let result = match self.status[slot] {
            JobStatus::Done => self.backend.read(slot),
            JobStatus::Failed => {
                let cause = self.backend.take_failure(slot).into_cause();
                Err(raise_evaluation(item, cause, Some(site.clone())))
            }
            JobStatus::Queued => unreachable!("completion drain left the slot queued"),
        };

        // refill the consumed slot one prediction past the ring's tail;
        // a failed refill surfaces at the next interaction
        let prev = (slot + n - 1) % n;
        self.todo[slot] = (self.anticipate)(self.todo[prev]);
        if let Err(e) = self.start_job(slot) {
            let _ = self.poison(e);
        }

        result
    }
}

/// Sequence evaluated ahead of consumption by a worker pool.
///
/// Behaves exactly like the wrapped sequence (`get(i)` returns what
/// `seq.get(i)` would), with items computed in the background. The
/// scheduler is single-consumer: concurrent readers serialize on an
/// internal lock.
pub struct Prefetcher<T> {
    state: Mutex<Scheduler<T>>,
    len: Option<usize>,
    site: Arc<Backtrace>,
}

impl<T> Prefetcher<T> {
    fn start(
        backend: Box<dyn AsyncBackend<Item = T> + Send>,
        len: Option<usize>,
        anticipate: Option<Anticipate>,
    ) -> Result<Self> {
        let anticipate = anticipate.unwrap_or_else(|| Arc::new(|i| i + 1));
        let ring = backend.ring_slots();

        let mut scheduler = Scheduler {
            backend,
            todo: vec![0; ring],
            status: vec![JobStatus::Queued; ring],
            first_slot: 0,
            anticipate,
            fatal: None,
        };
        for k in 1..ring {
            scheduler.todo[k] = (scheduler.anticipate)(scheduler.todo[k - 1]);
        }
        for k in 0..ring {
            scheduler.start_job(k)?;
        }

        Ok(Self {
            state: Mutex::new(scheduler),
            len,
            site: Arc::new(Backtrace::capture()),
        })
    }
}

impl<T> Sequence for Prefetcher<T> {
    type Item = T;

    fn len(&self) -> Option<usize> {
        self.len
    }

    fn get(&self, index: i64) -> Result<T> {
        let item = resolve_index(index, self.len)? as i64;
        self.state.lock().fetch(item, &self.site)
    }
}

/// Starts a worker pool prefetching `sequence` items before use.
///
/// The returned [`Prefetcher`] is itself a [`Sequence`] over the same
/// items. Dropping it drains the job queue, posts one terminate sentinel
/// per worker and joins them; in-flight items are discarded.
pub fn prefetch<S>(sequence: S, config: PrefetchConfig) -> Result<Prefetcher<S::Item>>
    where S: Sequence + Send + Sync + 'static, S::Item: Packable
{
    config.validate()?;
    let len = sequence.len();
    let nworkers = resolve_workers(config.nworkers);
    let seq = Arc::new(sequence);

    let backend: Box<dyn AsyncBackend<Item = S::Item> + Send> = match config.method {
        Method::Thread =>
            Box::new(
                ThreadBackend::new(
                    seq,
                    nworkers,
                    config.max_buffered,
                    config.timeout,
                    config.start_hook.clone()
                )?
            ),
        Method::Process => {
            // under zero-copy transport two arena slots stay out of
            // flight: one for the value being returned, one for a handle
            // the consumer may still hold
            let ring = if config.shm_size > 0 {
                config.max_buffered - SHM_RING_SLACK
            } else {
                config.max_buffered
            };
            Box::new(
                ProcessBackend::new(
                    seq,
                    nworkers,
                    ring,
                    config.max_buffered,
                    config.shm_size,
                    config.timeout,
                    config.start_hook.clone()
                )?
            )
        }
    };

    Prefetcher::start(backend, len, config.anticipate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::time::Instant;

    use crate::error::{ seterr, ErrorMode };
    use crate::sequence::SequenceExt;
    use crate::value::{ Bytes, Value };

    fn slow_identity(ms: u64) -> impl Fn(i64) -> i64 + Send + Sync {
        move |x| {
            std::thread::sleep(Duration::from_millis(ms));
            x
        }
    }

    #[test]
    fn test_linear_scan_preserves_order() {
        let pipeline = (0..100i64).collect::<Vec<_>>().smap(|x| x + 1);
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new().with_workers(4).with_max_buffered(10)
        ).unwrap();

        let out: Result<Vec<i64>> = fetched.items().collect();
        assert_eq!(out.unwrap(), (1..101).collect::<Vec<i64>>());
    }

    #[test]
    fn test_buffer_larger_than_sequence() {
        let pipeline = (0..10i64).collect::<Vec<_>>().smap(slow_identity(2));
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new().with_workers(4).with_max_buffered(50)
        ).unwrap();
        let out: Result<Vec<i64>> = fetched.items().collect();
        assert_eq!(out.unwrap(), (0..10).collect::<Vec<i64>>());
    }

    #[test]
    fn test_random_access_stays_correct_with_bounded_waste() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let pipeline = (0..300i64).collect::<Vec<_>>().smap(move |x| {
            calls2.fetch_add(1, Ordering::Relaxed);
            x
        });
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new().with_workers(4).with_max_buffered(10)
        ).unwrap();

        let pattern = [0i64, 50, 50, 7, 7, 7, 200];
        for &i in &pattern {
            assert_eq!(fetched.get(i).unwrap(), i);
        }

        // every off-prediction read wastes at most one ring of evaluations
        std::thread::sleep(Duration::from_millis(100));
        assert!(calls.load(Ordering::Relaxed) <= (pattern.len() + 2) * 10);
    }

    #[test]
    fn test_worker_error_wrap_and_recovery() {
        seterr(ErrorMode::Wrap);
        let pipeline = (0..10i64)
            .collect::<Vec<_>>()
            .try_smap(|x| {
                if x == 3 { Err("third item is broken".into()) } else { Ok(x) }
            });
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new().with_workers(2).with_max_buffered(2)
        ).unwrap();

        for i in 0..3i64 {
            assert_eq!(fetched.get(i).unwrap(), i);
        }
        match fetched.get(3) {
            Err(SlipstreamError::Evaluation(e)) => {
                assert_eq!(e.index(), 3);
                assert!(e.to_string().contains("third item is broken"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // the pipeline keeps serving after an evaluation error
        for i in 4..10i64 {
            assert_eq!(fetched.get(i).unwrap(), i);
        }
    }

    #[test]
    fn test_worker_error_passthrough() {
        seterr(ErrorMode::Passthrough);
        let pipeline = (0..5i64)
            .collect::<Vec<_>>()
            .try_smap(|x| {
                if x == 2 { Err("broken".into()) } else { Ok(x) }
            });
        let fetched = prefetch(pipeline, PrefetchConfig::new().with_workers(2)).unwrap();

        match fetched.get(2) {
            Err(SlipstreamError::External(e)) => assert!(e.to_string().contains("broken")),
            other => panic!("unexpected result: {other:?}"),
        }
        seterr(ErrorMode::Wrap);
    }

    #[test]
    fn test_anticipate_strided_access() {
        let pipeline = (0..200i64).collect::<Vec<_>>().smap(slow_identity(1));
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(20)
                .with_anticipate(|i| i + 2)
        ).unwrap();

        let evens: Vec<i64> = (0..200).step_by(2).collect();
        let out: Vec<i64> = evens
            .iter()
            .map(|&i| fetched.get(i).unwrap())
            .collect();
        assert_eq!(out, evens);
    }

    #[test]
    fn test_repeated_reads_and_jumps() {
        let pipeline = (0..300i64).collect::<Vec<_>>().smap(slow_identity(1));
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new().with_workers(4).with_max_buffered(10)
        ).unwrap();

        let mut i = 0i64;
        let mut hops = 0;
        for step in 0..400 {
            assert_eq!(fetched.get(i).unwrap(), i);
            if step % 37 == 0 && hops < 8 {
                i = (i * 7 + 13) % 300;
                hops += 1;
            } else {
                i = (i + 1) % 300;
            }
        }
    }

    #[test]
    fn test_prefetcher_is_a_sequence() {
        let fetched = prefetch(
            (0..50i64).collect::<Vec<_>>(),
            PrefetchConfig::new().with_workers(2)
        ).unwrap();
        assert_eq!(Sequence::len(&fetched), Some(50));
        assert_eq!(fetched.get(-1).unwrap(), 49);
        assert!(fetched.get(50).is_err());
    }

    #[test]
    fn test_invalid_configurations_are_rejected() {
        let cfg = PrefetchConfig::new().with_max_buffered(0);
        assert!(prefetch((0..4i64).collect::<Vec<_>>(), cfg).is_err());

        let cfg = PrefetchConfig::new().with_shm_size(1 << 20); // thread + shm
        assert!(prefetch((0..4i64).collect::<Vec<_>>(), cfg).is_err());

        let cfg = PrefetchConfig::new()
            .with_method(Method::Process)
            .with_shm_size(1 << 20)
            .with_max_buffered(2); // too small for zero-copy
        assert!(prefetch((0..4i64).collect::<Vec<_>>(), cfg).is_err());
    }

    #[test]
    fn test_workers_are_restarted_after_sleep() {
        let pipeline = (0..100i64).collect::<Vec<_>>().smap(|x| x);
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(4)
                .with_timeout(Duration::from_millis(200))
        ).unwrap();

        assert_eq!(fetched.get(0).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(600)); // all workers go to sleep
        // an off-prediction read forces fresh jobs through restarted workers
        let start = Instant::now();
        assert_eq!(fetched.get(50).unwrap(), 50);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    // The tests below fork real worker processes. They are excluded from
    // the default run because forking under the threaded test harness is
    // only safe when the rest of the suite is quiet.

    #[test]
    #[ignore = "forks worker processes; run with --ignored"]
    fn test_process_backend_linear_scan() {
        let pipeline = (0..200i64).collect::<Vec<_>>().smap(|x| x * 2);
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(8)
                .with_method(Method::Process)
        ).unwrap();

        let out: Result<Vec<i64>> = fetched.items().collect();
        assert_eq!(out.unwrap(), (0..200).map(|x| x * 2).collect::<Vec<i64>>());
    }

    #[test]
    #[ignore = "forks worker processes; run with --ignored"]
    fn test_process_backend_error_reports_formatted_cause() {
        let pipeline = (0..10i64)
            .collect::<Vec<_>>()
            .try_smap(|x| {
                if x == 3 { Err("third item is broken".into()) } else { Ok(x) }
            });
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(4)
                .with_method(Method::Process)
        ).unwrap();

        for i in 0..3i64 {
            assert_eq!(fetched.get(i).unwrap(), i);
        }
        match fetched.get(3) {
            Err(SlipstreamError::Evaluation(e)) => {
                assert!(e.to_string().contains("third item is broken"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    #[ignore = "forks worker processes; run with --ignored"]
    fn test_shared_memory_transport_recycles_slots() {
        let payload = 1024usize;
        let pipeline = (0..1000i64)
            .collect::<Vec<_>>()
            .smap(move |x| {
                Value::Tuple(
                    vec![Value::Int(x), Value::Bytes(Bytes::from(vec![x as u8; payload]))]
                )
            });
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(16)
                .with_method(Method::Process)
                .with_shm_size(16 * 4096)
        ).unwrap();

        // holding each item for exactly one step must never exhaust the pool
        let mut previous: Option<Value> = None;
        for i in 0..1000i64 {
            let value = fetched.get(i).unwrap();
            match &value {
                Value::Tuple(items) => {
                    assert_eq!(items[0], Value::Int(i));
                    match &items[1] {
                        Value::Bytes(b) => {
                            assert!(b.is_shared());
                            assert_eq!(b.as_slice(), &vec![i as u8; payload][..]);
                        }
                        other => panic!("unexpected leaf: {other:?}"),
                    }
                }
                other => panic!("unexpected value: {other:?}"),
            }
            previous = Some(value);
        }
        drop(previous);
    }

    #[test]
    #[ignore = "forks and kills worker processes; run with --ignored"]
    fn test_worker_death_raises_instead_of_hanging() {
        // item 50 takes its worker down without a completion
        let pipeline = (0..1000i64).collect::<Vec<_>>().smap(|x| {
            if x == 50 {
                std::process::abort();
            }
            x
        });
        let fetched = prefetch(
            pipeline,
            PrefetchConfig::new()
                .with_workers(2)
                .with_max_buffered(4)
                .with_method(Method::Process)
        ).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut observed = false;
        for i in 0..1000i64 {
            match fetched.get(i) {
                Ok(value) => assert_eq!(value, i),
                Err(SlipstreamError::WorkerDied) => {
                    observed = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
            assert!(Instant::now() < deadline, "worker death was never surfaced");
        }
        assert!(observed);
    }
}
