//! Process prefetch backend
//!
//! Workers are forked from the parent and inherit the pipeline, so no
//! closure ever needs to be serialized. Jobs travel through a fixed-record
//! queue in shared memory; results come back through one pipe per worker,
//! either as a bincode payload or as a packed descriptor pointing into the
//! shared-memory arena. The parent waits on the whole pipe set at once and
//! a heartbeat thread turns abnormal worker exits into a fatal flag.

use std::fs::File;
use std::io::{ Read, Write };
use std::os::fd::AsFd;
use std::panic::{ catch_unwind, AssertUnwindSafe };
use std::process;
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::poll::{ poll, PollFd, PollFlags, PollTimeout };
use nix::sys::signal::{ signal, SigHandler, Signal };
use nix::sys::wait::{ waitpid, WaitPidFlag, WaitStatus };
use nix::unistd::{ fork, getpid, getppid, pipe, ForkResult, Pid };
use parking_lot::Mutex;
use tracing::{ debug, warn };

use crate::constants::{ COMPLETION_POLL_INTERVAL, HEARTBEAT_INTERVAL, RESULT_HEADER_SIZE, SHUTDOWN_DRAIN_TIMEOUT };
use crate::error::{ seterr, ErrorMode, Result, SlipstreamError };
use crate::prefetch::arena::{ SharedArena, SlotView };
use crate::prefetch::backend::{ panic_message, AsyncBackend, JobFailure, SlotState };
use crate::prefetch::pack::{ Packable, PackedNode, SlotWriter };
use crate::prefetch::queue::{ JobMsg, ShmQueue };
use crate::prefetch::StartHook;
use crate::sequence::Sequence;

const STATUS_DONE: u8 = 0;
const STATUS_FAILED: u8 = 1;
const STATUS_ASLEEP: u8 = 2;

const TRANSPORT_SERIALIZED: u8 = 0;
const TRANSPORT_PACKED: u8 = 1;

/// Fixed binary header of a message on a worker result pipe
#[derive(Debug, Clone, Copy)]
struct ResultHeader {
    index: i64,
    slot: i32,
    status: u8,
    transport: u8,
    payload_len: u32,
}

impl ResultHeader {
    const SIZE: usize = RESULT_HEADER_SIZE;

    fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.slot.to_le_bytes());
        buf[12] = self.status;
        buf[13] = self.transport;
        buf[16..20].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    fn deserialize(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            index: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
            slot: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            status: buf[12],
            transport: buf[13],
            payload_len: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WorkerState {
    Alive(Pid),
    Reaped,
}

struct WorkerPipe {
    reader: File,
    writer: File,
}

pub(crate) struct ProcessBackend<S: Sequence + Send + Sync + 'static> where S::Item: Packable {
    seq: Arc<S>,
    jobs: ShmQueue<JobMsg>,
    arena: Option<SharedArena>,
    slots: Vec<SlotState<S::Item>>,
    /// arena slot assigned to the in-flight job of each ring slot
    arena_of: Vec<Option<u32>>,
    pipes: Vec<WorkerPipe>,
    states: Arc<Mutex<Vec<WorkerState>>>,
    died: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_stop: Arc<AtomicBool>,
    parent_pid: Pid,
    timeout: Duration,
    start_hook: Option<StartHook>,
}

impl<S> ProcessBackend<S>
    where S: Sequence + Send + Sync + 'static, S::Item: Packable
{
    pub fn new(
        seq: Arc<S>,
        nworkers: usize,
        ring: usize,
        arena_slots: usize,
        shm_size: usize,
        timeout: Duration,
        start_hook: Option<StartHook>,
    ) -> Result<Self> {
        let jobs = ShmQueue::new(arena_slots + nworkers)?;
        let arena = if shm_size > 0 {
            Some(SharedArena::new(shm_size, arena_slots)?)
        } else {
            None
        };

        let mut pipes = Vec::with_capacity(nworkers);
        for _ in 0..nworkers {
            let (read_fd, write_fd) = pipe().map_err(|e| {
                SlipstreamError::system(format!("pipe failed: {e}"))
            })?;
            pipes.push(WorkerPipe {
                reader: File::from(read_fd),
                writer: File::from(write_fd),
            });
        }

        let mut backend = Self {
            seq,
            jobs,
            arena,
            slots: (0..ring).map(|_| SlotState::Empty).collect(),
            arena_of: vec![None; ring],
            pipes,
            states: Arc::new(Mutex::new(vec![WorkerState::Reaped; nworkers])),
            died: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
            heartbeat_stop: Arc::new(AtomicBool::new(false)),
            parent_pid: getpid(),
            timeout,
            start_hook,
        };

        for id in 0..nworkers {
            backend.spawn_worker(id)?;
        }

        let states = backend.states.clone();
        let died = backend.died.clone();
        let stop = backend.heartbeat_stop.clone();
        backend.heartbeat = Some(
            std::thread::Builder
                ::new()
                .name("slipstream-heartbeat".to_string())
                .spawn(move || heartbeat_loop(&states, &died, &stop))
                .map_err(|e| {
                    SlipstreamError::system(format!("failed to spawn heartbeat thread: {e}"))
                })?
        );

        Ok(backend)
    }

    /// Fork a fresh worker into slot `id`, reaping the previous one first.
    ///
    /// SIGINT is ignored until the fork returns so a consumer Ctrl-C does
    /// not race with process creation.
    fn spawn_worker(&mut self, id: usize) -> Result<()> {
        let previous = { self.states.lock()[id] };
        if let WorkerState::Alive(pid) = previous {
            let _ = waitpid(pid, None);
            self.states.lock()[id] = WorkerState::Reaped;
        }

        let old_handler = unsafe {
            signal(Signal::SIGINT, SigHandler::SigIgn).map_err(|e| {
                SlipstreamError::system(format!("failed to mask SIGINT: {e}"))
            })?
        };

        let fork_result = unsafe { fork() };
        match fork_result {
            Ok(ForkResult::Child) => {
                worker_main(
                    id,
                    self.parent_pid,
                    &*self.seq,
                    self.arena.as_ref(),
                    &self.jobs,
                    &self.pipes[id].writer,
                    self.timeout,
                    &self.start_hook,
                );
            }
            Ok(ForkResult::Parent { child }) => {
                self.states.lock()[id] = WorkerState::Alive(child);
            }
            Err(e) => {
                unsafe {
                    let _ = signal(Signal::SIGINT, old_handler);
                }
                return Err(SlipstreamError::system(format!("fork failed: {e}")));
            }
        }

        unsafe {
            let _ = signal(Signal::SIGINT, old_handler);
        }
        Ok(())
    }

    fn pipe_readable(&self, worker: usize) -> bool {
        let mut fds = [PollFd::new(self.pipes[worker].reader.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(20u16)) {
            Ok(n) if n > 0 => {
                fds[0].revents().is_some_and(|r| r.intersects(PollFlags::POLLIN))
            }
            _ => false,
        }
    }

    fn read_message(&mut self, worker: usize) -> Result<(ResultHeader, Vec<u8>)> {
        let mut header_buf = [0u8; ResultHeader::SIZE];
        (&self.pipes[worker].reader).read_exact(&mut header_buf)?;
        let header = ResultHeader::deserialize(&header_buf);

        let mut payload = vec![0u8; header.payload_len as usize];
        if !payload.is_empty() {
            (&self.pipes[worker].reader).read_exact(&mut payload)?;
        }
        Ok((header, payload))
    }

    fn store_completion(
        &mut self,
        header: &ResultHeader,
        payload: &[u8],
    ) -> Result<(i64, usize, bool)> {
        let slot = header.slot as usize;
        if slot >= self.slots.len() {
            return Err(SlipstreamError::system("completion for an unknown ring slot"));
        }
        let assigned = self.arena_of[slot].take();

        let state = if header.status == STATUS_FAILED {
            if let (Some(idx), Some(arena)) = (assigned, self.arena.as_ref()) {
                arena.release(idx);
            }
            let message = decode_failure(payload);
            SlotState::Failed(JobFailure::Message(message))
        } else {
            match header.transport {
                TRANSPORT_PACKED => {
                    match self.unpack_completion(assigned, payload) {
                        Ok(value) => SlotState::Value(value),
                        Err(e) => SlotState::Failed(JobFailure::Error(e)),
                    }
                }
                _ => {
                    if let (Some(idx), Some(arena)) = (assigned, self.arena.as_ref()) {
                        arena.release(idx);
                    }
                    match
                        bincode::serde::decode_from_slice::<S::Item, _>(
                            payload,
                            bincode::config::standard()
                        )
                    {
                        Ok((value, _)) => SlotState::Value(value),
                        Err(e) => {
                            SlotState::Failed(
                                JobFailure::Error(SlipstreamError::serialization(e.to_string()))
                            )
                        }
                    }
                }
            }
        };

        let failed = matches!(state, SlotState::Failed(_));
        self.slots[slot] = state;
        Ok((header.index, slot, failed))
    }

    fn unpack_completion(&self, assigned: Option<u32>, payload: &[u8]) -> Result<S::Item> {
        let arena = self.arena
            .as_ref()
            .ok_or_else(|| SlipstreamError::system("packed result without a shared arena"))?;
        let index = assigned.ok_or_else(|| {
            SlipstreamError::system("packed result without an assigned arena slot")
        })?;
        let (node, _) = bincode::serde
            ::decode_from_slice::<PackedNode, _>(payload, bincode::config::standard())
            .map_err(|e| SlipstreamError::serialization(e.to_string()))?;
        let view = SlotView::new(arena.handle(index));
        <S::Item as Packable>::unpack(&node, &view)
    }
}

impl<S> AsyncBackend for ProcessBackend<S>
    where S: Sequence + Send + Sync + 'static, S::Item: Packable
{
    type Item = S::Item;

    fn submit(&mut self, index: i64, slot: usize) -> Result<()> {
        self.slots[slot] = SlotState::Empty;

        let arena_slot = match &self.arena {
            Some(arena) =>
                match arena.fetch() {
                    Some(idx) => {
                        self.arena_of[slot] = Some(idx);
                        idx as i32
                    }
                    None => {
                        return Err(if self.died.load(Ordering::Relaxed) {
                            SlipstreamError::WorkerDied
                        } else {
                            SlipstreamError::BufferExhausted
                        });
                    }
                }
            None => -1,
        };

        self.jobs.put(JobMsg { index, slot: slot as i32, arena: arena_slot })
    }

    fn next_completion(&mut self) -> Result<(i64, usize, bool)> {
        loop {
            if self.died.load(Ordering::Relaxed) {
                return Err(SlipstreamError::WorkerDied);
            }

            let ready = {
                let mut fds: Vec<PollFd> = self.pipes
                    .iter()
                    .map(|p| PollFd::new(p.reader.as_fd(), PollFlags::POLLIN))
                    .collect();
                let timeout = PollTimeout::from(COMPLETION_POLL_INTERVAL.as_millis() as u16);
                match poll(&mut fds, timeout) {
                    Ok(0) => continue,
                    Ok(_) => fds
                        .iter()
                        .position(|fd| {
                            fd.revents().is_some_and(|r| r.intersects(PollFlags::POLLIN))
                        }),
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        return Err(SlipstreamError::system(format!("poll failed: {e}")));
                    }
                }
            };

            let Some(worker) = ready else { continue };
            let (header, payload) = self.read_message(worker)?;

            if header.status == STATUS_ASLEEP {
                let id = (-header.slot - 1) as usize;
                debug!(worker = id, "worker went to sleep");
                self.spawn_worker(id)?;
                continue;
            }

            return self.store_completion(&header, &payload);
        }
    }

    fn read(&mut self, slot: usize) -> Result<Self::Item> {
        match std::mem::replace(&mut self.slots[slot], SlotState::Empty) {
            SlotState::Value(value) => Ok(value),
            _ => Err(SlipstreamError::system("ring slot read before its completion")),
        }
    }

    fn take_failure(&mut self, slot: usize) -> JobFailure {
        match std::mem::replace(&mut self.slots[slot], SlotState::Empty) {
            SlotState::Failed(failure) => failure,
            _ => JobFailure::Message("failure record missing from ring slot".to_string()),
        }
    }

    fn ring_slots(&self) -> usize {
        self.slots.len()
    }
}

impl<S: Sequence + Send + Sync + 'static> Drop for ProcessBackend<S> where S::Item: Packable {
    fn drop(&mut self) {
        self.heartbeat_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }

        // drain pending jobs, then one terminate sentinel per worker
        while let Ok(Some(msg)) = self.jobs.get(Some(SHUTDOWN_DRAIN_TIMEOUT)) {
            if let (Some(arena), true) = (self.arena.as_ref(), msg.arena >= 0) {
                arena.release(msg.arena as u32);
            }
        }
        for _ in 0..self.pipes.len() {
            let _ = self.jobs.put(JobMsg::terminate());
        }

        // reap workers, draining their pipes so none stays blocked on a
        // half-written result
        loop {
            let snapshot = self.states.lock().clone();
            let mut any_alive = false;
            for (id, state) in snapshot.iter().enumerate() {
                if let WorkerState::Alive(pid) = *state {
                    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {
                            any_alive = true;
                            if self.pipe_readable(id) {
                                let _ = self.read_message(id);
                            }
                        }
                        _ => {
                            self.states.lock()[id] = WorkerState::Reaped;
                        }
                    }
                }
            }
            if !any_alive {
                break;
            }
        }
    }
}

fn heartbeat_loop(
    states: &Mutex<Vec<WorkerState>>,
    died: &AtomicBool,
    stop: &AtomicBool,
) {
    let step = HEARTBEAT_INTERVAL / 10;
    while !stop.load(Ordering::Relaxed) {
        {
            let mut states = states.lock();
            for state in states.iter_mut() {
                if let WorkerState::Alive(pid) = *state {
                    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {}
                        Ok(WaitStatus::Exited(_, 0)) => {
                            // voluntary exit (idle timeout); respawned on demand
                            *state = WorkerState::Reaped;
                        }
                        Ok(status) => {
                            warn!(?status, "worker died abnormally");
                            *state = WorkerState::Reaped;
                            died.store(true, Ordering::Relaxed);
                        }
                        Err(_) => {
                            *state = WorkerState::Reaped;
                            died.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        for _ in 0..10 {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(step);
        }
    }
}

fn decode_failure(payload: &[u8]) -> String {
    if payload.is_empty() {
        return "worker reported an unrenderable error".to_string();
    }
    bincode::serde
        ::decode_from_slice::<String, _>(payload, bincode::config::standard())
        .map(|(message, _)| message)
        .unwrap_or_else(|_| "worker reported an undecodable error".to_string())
}

fn encode_success<T: Packable>(
    value: &T,
    arena_slot: i32,
    arena: Option<&SharedArena>,
    index: i64,
) -> (u8, u8, Vec<u8>) {
    if arena_slot >= 0 {
        if let Some(arena) = arena {
            let slot = unsafe { arena.slot_mut(arena_slot as u32) };
            let mut writer = SlotWriter::new(slot);
            match value.pack(&mut writer) {
                Ok(node) =>
                    match bincode::serde::encode_to_vec(&node, bincode::config::standard()) {
                        Ok(descriptor) => {
                            return (STATUS_DONE, TRANSPORT_PACKED, descriptor);
                        }
                        Err(e) => {
                            warn!(index, error = %e, "descriptor encode failed, falling back to serialized transport");
                        }
                    }
                Err(e) => {
                    warn!(index, error = %e, "item does not fit its shared-memory slot, falling back to serialized transport");
                }
            }
        }
    }

    match bincode::serde::encode_to_vec(value, bincode::config::standard()) {
        Ok(bytes) => (STATUS_DONE, TRANSPORT_SERIALIZED, bytes),
        Err(e) => (STATUS_FAILED, TRANSPORT_SERIALIZED, encode_failure_message(&e.to_string())),
    }
}

fn encode_failure_message(message: &str) -> Vec<u8> {
    bincode::serde
        ::encode_to_vec(message, bincode::config::standard())
        .unwrap_or_default()
}

/// Body of a worker process; never returns.
fn worker_main<S>(
    id: usize,
    parent: Pid,
    seq: &S,
    arena: Option<&SharedArena>,
    jobs: &ShmQueue<JobMsg>,
    pipe: &File,
    timeout: Duration,
    hook: &Option<StartHook>,
) -> !
    where S: Sequence, S::Item: Packable
{
    if let Some(hook) = hook {
        hook();
    }
    seterr(ErrorMode::Passthrough);
    debug!(worker = id, "worker starting");

    loop {
        let msg = match jobs.get(Some(timeout)) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                if getppid() != parent {
                    debug!(worker = id, "parent died, exiting");
                    process::exit(0);
                }
                let header = ResultHeader {
                    index: 0,
                    slot: -(id as i32) - 1,
                    status: STATUS_ASLEEP,
                    transport: TRANSPORT_SERIALIZED,
                    payload_len: 0,
                };
                let _ = (&*pipe).write_all(&header.serialize());
                debug!(worker = id, "worker timeout, exiting");
                process::exit(0);
            }
            Err(_) => process::exit(1),
        };

        if msg.is_terminate() {
            debug!(worker = id, "worker exiting");
            process::exit(0);
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| seq.get(msg.index)));
        let (status, transport, payload) = match &outcome {
            Ok(Ok(value)) => encode_success(value, msg.arena, arena, msg.index),
            Ok(Err(e)) => {
                (STATUS_FAILED, TRANSPORT_SERIALIZED, encode_failure_message(&e.to_string()))
            }
            Err(panic) => {
                (
                    STATUS_FAILED,
                    TRANSPORT_SERIALIZED,
                    encode_failure_message(&panic_message(panic.as_ref())),
                )
            }
        };

        let header = ResultHeader {
            index: msg.index,
            slot: msg.slot,
            status,
            transport,
            payload_len: payload.len() as u32,
        };
        if (&*pipe).write_all(&header.serialize()).is_err() {
            debug!(worker = id, "parent died, exiting");
            process::exit(0);
        }
        if !payload.is_empty() && (&*pipe).write_all(&payload).is_err() {
            debug!(worker = id, "parent died, exiting");
            process::exit(0);
        }
    }
}
