//! Threaded prefetch backend
//!
//! Workers are plain threads sharing the pipeline through an `Arc`; values
//! never cross an address-space boundary, so the original error objects are
//! transported intact. Good for I/O-bound stages or when the evaluation
//! cost is dominated by blocking calls.

use std::panic::{ catch_unwind, AssertUnwindSafe };
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{ bounded, Receiver, RecvTimeoutError, Sender };
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{ seterr, ErrorMode, Result, SlipstreamError };
use crate::prefetch::backend::{ panic_message, AsyncBackend, Completion, Job, JobFailure, SlotState };
use crate::prefetch::StartHook;
use crate::sequence::Sequence;

pub(crate) struct ThreadBackend<S: Sequence> {
    seq: Arc<S>,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    slots: Arc<Vec<Mutex<SlotState<S::Item>>>>,
    workers: Vec<Option<JoinHandle<()>>>,
    timeout: Duration,
    start_hook: Option<StartHook>,
}

impl<S> ThreadBackend<S> where S: Sequence + Send + Sync + 'static, S::Item: Send + 'static {
    pub fn new(
        seq: Arc<S>,
        nworkers: usize,
        ring: usize,
        timeout: Duration,
        start_hook: Option<StartHook>,
    ) -> Result<Self> {
        let (jobs_tx, jobs_rx) = bounded(ring + nworkers);
        let (done_tx, done_rx) = bounded(ring + nworkers);
        let slots = Arc::new((0..ring).map(|_| Mutex::new(SlotState::Empty)).collect::<Vec<_>>());

        let mut backend = Self {
            seq,
            jobs_tx,
            jobs_rx,
            done_tx,
            done_rx,
            slots,
            workers: (0..nworkers).map(|_| None).collect(),
            timeout,
            start_hook,
        };
        for id in 0..nworkers {
            backend.spawn_worker(id)?;
        }
        Ok(backend)
    }

    fn spawn_worker(&mut self, id: usize) -> Result<()> {
        if let Some(handle) = self.workers[id].take() {
            let _ = handle.join();
        }

        let seq = self.seq.clone();
        let slots = self.slots.clone();
        let jobs = self.jobs_rx.clone();
        let done = self.done_tx.clone();
        let timeout = self.timeout;
        let hook = self.start_hook.clone();

        let handle = std::thread::Builder
            ::new()
            .name(format!("slipstream-worker-{id}"))
            .spawn(move || worker_loop(id, seq, slots, jobs, done, timeout, hook))
            .map_err(|e| SlipstreamError::system(format!("failed to spawn worker thread: {e}")))?;
        self.workers[id] = Some(handle);
        Ok(())
    }
}

fn worker_loop<S>(
    id: usize,
    seq: Arc<S>,
    slots: Arc<Vec<Mutex<SlotState<S::Item>>>>,
    jobs: Receiver<Job>,
    done: Sender<Completion>,
    timeout: Duration,
    hook: Option<StartHook>,
)
    where S: Sequence
{
    if let Some(hook) = &hook {
        hook();
    }
    seterr(ErrorMode::Passthrough);
    debug!(worker = id, "worker starting");

    loop {
        let job = match jobs.recv_timeout(timeout) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                let _ = done.send(Completion {
                    index: 0,
                    slot: -(id as i32) - 1,
                    failed: false,
                });
                debug!(worker = id, "worker timeout, exiting");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!(worker = id, "job queue closed, exiting");
                return;
            }
        };

        if job.slot < 0 {
            debug!(worker = id, "worker exiting");
            return;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| seq.get(job.index)));
        let (state, failed) = match outcome {
            Ok(Ok(value)) => (SlotState::Value(value), false),
            Ok(Err(e)) => (SlotState::Failed(JobFailure::Error(e)), true),
            Err(payload) => {
                (SlotState::Failed(JobFailure::Message(panic_message(payload.as_ref()))), true)
            }
        };
        *slots[job.slot as usize].lock() = state;

        if done.send(Completion { index: job.index, slot: job.slot, failed }).is_err() {
            return;
        }
    }
}

impl<S> AsyncBackend for ThreadBackend<S>
    where S: Sequence + Send + Sync + 'static, S::Item: Send + 'static
{
    type Item = S::Item;

    fn submit(&mut self, index: i64, slot: usize) -> Result<()> {
        *self.slots[slot].lock() = SlotState::Empty;
        self.jobs_tx
            .send(Job { index, slot: slot as i32 })
            .map_err(|_| SlipstreamError::WorkerDied)
    }

    fn next_completion(&mut self) -> Result<(i64, usize, bool)> {
        loop {
            let completion = self.done_rx.recv().map_err(|_| SlipstreamError::WorkerDied)?;
            if completion.slot < 0 {
                let id = (-completion.slot - 1) as usize;
                self.spawn_worker(id)?;
                continue;
            }
            return Ok((completion.index, completion.slot as usize, completion.failed));
        }
    }

    fn read(&mut self, slot: usize) -> Result<Self::Item> {
        match std::mem::replace(&mut *self.slots[slot].lock(), SlotState::Empty) {
            SlotState::Value(value) => Ok(value),
            _ => Err(SlipstreamError::system("ring slot read before its completion")),
        }
    }

    fn take_failure(&mut self, slot: usize) -> JobFailure {
        match std::mem::replace(&mut *self.slots[slot].lock(), SlotState::Empty) {
            SlotState::Failed(failure) => failure,
            _ => JobFailure::Message("failure record missing from ring slot".to_string()),
        }
    }

    fn ring_slots(&self) -> usize {
        self.slots.len()
    }
}

impl<S: Sequence> Drop for ThreadBackend<S> {
    fn drop(&mut self) {
        // drain pending jobs, then one terminate sentinel per worker
        while self.jobs_rx.try_recv().is_ok() {}
        for _ in 0..self.workers.len() {
            let _ = self.jobs_tx.send(Job { index: 0, slot: -1 });
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}
