//! Read-tap and throughput instrumentation for pipelines

use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::error::Result;
use crate::sequence::{ resolve_index, Sequence };

/// Sequence wrapper calling a hook on every read
pub struct Debug<S: Sequence, F> {
    seq: S,
    hook: F,
    max_calls: Option<usize>,
    max_rate: Option<f64>,
    state: Mutex<DebugState>,
}

struct DebugState {
    n_calls: usize,
    last_call: Option<Instant>,
}

/// Wrap a sequence to trigger `hook(index, &value)` on element reads.
///
/// `max_calls` bounds how many times the hook fires; `max_rate` (in calls
/// per second) silences it when reads come too fast.
pub fn debug<S, F>(seq: S, hook: F, max_calls: Option<usize>, max_rate: Option<f64>) -> Debug<S, F>
    where S: Sequence, F: Fn(i64, &S::Item)
{
    Debug {
        seq,
        hook,
        max_calls,
        max_rate,
        state: Mutex::new(DebugState { n_calls: 0, last_call: None }),
    }
}

impl<S: Sequence, F> Debug<S, F> {
    fn silenced(&self, state: &DebugState) -> bool {
        if let Some(max_calls) = self.max_calls {
            if state.n_calls >= max_calls {
                return true;
            }
        }
        if let (Some(max_rate), Some(last)) = (self.max_rate, state.last_call) {
            if last.elapsed().as_secs_f64() < 1.0 / max_rate {
                return true;
            }
        }
        false
    }
}

impl<S, F> Sequence for Debug<S, F> where S: Sequence, F: Fn(i64, &S::Item) {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        self.seq.len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let i = resolve_index(index, self.seq.len())? as i64;
        let value = self.seq.get(i)?;

        let mut state = self.state.lock();
        if !self.silenced(&state) {
            (self.hook)(i, &value);
            state.last_call = Some(Instant::now());
            state.n_calls += 1;
        }
        Ok(value)
    }
}

/// Sequence wrapper measuring item read delays.
///
/// Delays are recorded into an HDR histogram with microsecond resolution,
/// so tails are available next to the mean.
pub struct ThroughputMonitor<S> {
    seq: S,
    stats: Mutex<ThroughputStats>,
}

struct ThroughputStats {
    delays_us: Histogram<u64>,
    total_secs: f64,
}

/// Wrap a sequence to measure read throughput and delay.
pub fn monitor_throughput<S: Sequence>(seq: S) -> ThroughputMonitor<S> {
    ThroughputMonitor {
        seq,
        stats: Mutex::new(ThroughputStats {
            delays_us: Histogram::new(3).expect("histogram construction cannot fail"),
            total_secs: 0.0,
        }),
    }
}

impl<S: Sequence> ThroughputMonitor<S> {
    /// Item read throughput in items per second.
    ///
    /// Returns `None` before the first read.
    pub fn throughput(&self) -> Option<f64> {
        let stats = self.stats.lock();
        if stats.delays_us.is_empty() {
            None
        } else {
            Some(stats.delays_us.len() as f64 / stats.total_secs)
        }
    }

    /// Mean item read delay in seconds.
    pub fn read_delay(&self) -> Option<f64> {
        let stats = self.stats.lock();
        if stats.delays_us.is_empty() {
            None
        } else {
            Some(stats.total_secs / stats.delays_us.len() as f64)
        }
    }

    /// Read delay at the given percentile, in seconds.
    pub fn delay_percentile(&self, percentile: f64) -> Option<f64> {
        let stats = self.stats.lock();
        if stats.delays_us.is_empty() {
            None
        } else {
            Some(stats.delays_us.value_at_percentile(percentile) as f64 / 1e6)
        }
    }

    /// Forget everything recorded so far.
    pub fn reset(&self) {
        let mut stats = self.stats.lock();
        stats.delays_us.reset();
        stats.total_secs = 0.0;
    }
}

impl<S: Sequence> Sequence for ThroughputMonitor<S> {
    type Item = S::Item;

    fn len(&self) -> Option<usize> {
        self.seq.len()
    }

    fn get(&self, index: i64) -> Result<Self::Item> {
        let start = Instant::now();
        let value = self.seq.get(index)?;
        let elapsed = start.elapsed();

        let mut stats = self.stats.lock();
        let _ = stats.delays_us.record(elapsed.as_micros() as u64);
        stats.total_secs += elapsed.as_secs_f64();
        Ok(value)
    }
}
