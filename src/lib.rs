//! slipstream - lazy sequence transformations with asynchronous prefetching
//!
//! A pipeline is a composition of on-demand views over indexable data:
//! map, gather, batch, concatenate, interleave, split, cycle, repeat,
//! cache. Nothing is evaluated until an item is read, and reading an item
//! re-triggers the whole lazy chain. At the tail of a pipeline,
//! [`prefetch::prefetch`] attaches a worker pool (threads or forked
//! processes, optionally with zero-copy shared-memory transport) that
//! evaluates items ahead of consumption without changing what the
//! pipeline returns.

pub mod constants;
pub mod error;
pub mod instrument;
pub mod prefetch;
pub mod sequence;
pub mod value;

// Re-export main components
pub use error::{ seterr, ErrorMode, EvaluationError, Result, SlipstreamError };
pub use prefetch::{ prefetch, Method, Packable, PrefetchConfig, Prefetcher };
pub use sequence::{
    add_cache,
    arange,
    batch,
    collate,
    concatenate,
    cycle,
    gather,
    interleave,
    repeat,
    smap,
    split,
    starmap,
    take,
    try_smap,
    unbatch,
    uniter,
    zip,
    Edges,
    Sequence,
    SequenceExt,
};
pub use value::{ Bytes, Value };

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
