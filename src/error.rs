//! Error types and propagation policy for the slipstream library
//!
//! Errors fall into three tiers:
//!
//! - **Structural** errors are raised synchronously by sequence views and
//!   always carry the offending index or length.
//! - **Evaluation** errors come from user code running under a view or a
//!   prefetch worker. They are caught at the worker boundary, transported as
//!   failed completions and re-raised on the consumer side according to the
//!   configured [`ErrorMode`].
//! - **Fatal** infrastructure errors (worker death, buffer exhaustion) are
//!   surfaced at the next consumer interaction and poison the pipeline.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for slipstream operations
pub type Result<T> = std::result::Result<T, SlipstreamError>;

/// Type-erased error produced by user code
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the slipstream library
#[derive(Error, Debug)]
pub enum SlipstreamError {
    /// Index outside `[-len, len)` for a finite view
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange {
        /// The requested index
        index: i64,
        /// Length of the sequence that rejected it
        len: usize,
    },

    /// Index shape not supported by the view (e.g. negative index on an
    /// unbounded view)
    #[error("invalid index: {message}")]
    InvalidIndex {
        /// Description of the violation
        message: String,
    },

    /// Inputs of a combinator disagree on length
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Length imposed by the first input
        expected: usize,
        /// Offending length
        actual: usize,
    },

    /// A combinator parameter is outside its supported range
    #[error("value out of range: {message}")]
    ValueOutOfRange {
        /// Description of the violation
        message: String,
    },

    /// Invalid configuration parameter
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration issue
        message: String,
    },

    /// Failure observed while evaluating a pipeline item
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    /// Original user error, re-raised untouched in passthrough mode
    #[error("{0}")]
    External(BoxError),

    /// The shared-memory arena has no free slot left
    #[error("shared buffer exhausted, hold references to fewer buffered items")]
    BufferExhausted,

    /// A worker process died and cannot be recovered
    #[error("a prefetch worker died unexpectedly")]
    WorkerDied,

    /// Serialization/deserialization failure on the worker-parent channel
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization issue
        message: String,
    },

    /// Operating system level failure (mmap, semaphores, fork, pipes)
    #[error("system error: {message}")]
    System {
        /// Description of the system issue
        message: String,
    },

    /// I/O errors from pipe transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SlipstreamError {
    /// Create a new invalid index error
    pub fn invalid_index(message: impl Into<String>) -> Self {
        Self::InvalidIndex { message: message.into() }
    }

    /// Create a new value out of range error
    pub fn value_out_of_range(message: impl Into<String>) -> Self {
        Self::ValueOutOfRange { message: message.into() }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig { message: message.into() }
    }

    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Create a new system error
    pub fn system(message: impl Into<String>) -> Self {
        Self::System { message: message.into() }
    }

    /// Check whether this error poisons the pipeline that produced it
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::BufferExhausted | Self::WorkerDied | Self::System { .. })
    }
}

/// Cause of an evaluation failure, as it survived transport from the worker
#[derive(Debug)]
pub enum FailureCause {
    /// The original error object (thread workers share the address space)
    Original(BoxError),
    /// Formatted rendition, used when the original could not cross a
    /// process boundary
    Formatted(String),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Original(e) => write!(f, "{e}"),
            FailureCause::Formatted(s) => write!(f, "{s}"),
        }
    }
}

/// Failure observed at a pipeline stage.
///
/// Carries the failing item index, the cause as it survived transport and,
/// when the stage captured one, the backtrace of the pipeline construction
/// site, which is usually far more useful than the worker-side stack.
#[derive(Debug)]
pub struct EvaluationError {
    index: i64,
    cause: FailureCause,
    site: Option<Arc<Backtrace>>,
}

impl EvaluationError {
    pub fn new(index: i64, cause: FailureCause, site: Option<Arc<Backtrace>>) -> Self {
        Self { index, cause, site }
    }

    /// Index of the item whose evaluation failed
    pub fn index(&self) -> i64 {
        self.index
    }

    /// The transported cause
    pub fn cause(&self) -> &FailureCause {
        &self.cause
    }

    /// Backtrace captured where the failing stage was constructed
    pub fn construction_site(&self) -> Option<&Backtrace> {
        self.site.as_deref()
    }
}

impl fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to evaluate item {}: {}", self.index, self.cause)?;
        if let Some(site) = &self.site {
            write!(f, "\nstage constructed at:\n{site}")?;
        }
        Ok(())
    }
}

impl std::error::Error for EvaluationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.cause {
            FailureCause::Original(e) => Some(e.as_ref()),
            FailureCause::Formatted(_) => None,
        }
    }
}

/// How evaluation errors from user code are propagated to the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Re-wrap the cause in an [`EvaluationError`] carrying the failing
    /// index and the construction site
    Wrap,
    /// Raise the original error when it survived transport; useful for
    /// step-by-step debugging
    Passthrough,
}

thread_local! {
    static ERROR_MODE: Cell<ErrorMode> = const { Cell::new(ErrorMode::Wrap) };
}

/// Set how evaluation errors are propagated on the current thread.
///
/// Workers set their own mode to [`ErrorMode::Passthrough`] so that nested
/// pipelines running inside worker code observe original errors.
pub fn seterr(mode: ErrorMode) {
    ERROR_MODE.with(|m| m.set(mode));
}

/// Current error propagation mode of this thread
pub fn error_mode() -> ErrorMode {
    ERROR_MODE.with(Cell::get)
}

/// Build the error returned to the consumer for a failed item, honoring the
/// thread's [`ErrorMode`].
///
/// Causes that only survived transport in formatted form are wrapped
/// regardless of the mode.
pub(crate) fn raise_evaluation(
    index: i64,
    cause: FailureCause,
    site: Option<Arc<Backtrace>>,
) -> SlipstreamError {
    match (error_mode(), cause) {
        (ErrorMode::Passthrough, FailureCause::Original(e)) => match e.downcast::<SlipstreamError>() {
            Ok(original) => *original,
            Err(e) => SlipstreamError::External(e),
        },
        (_, cause) => SlipstreamError::Evaluation(EvaluationError::new(index, cause, site)),
    }
}
