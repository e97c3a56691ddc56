//! Runtime tuning knobs.

use std::time::Duration;

/// Default native stack size assumed when the platform cannot report one.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Default headroom kept in reserve below the usable stack.
pub const DEFAULT_STACK_CUSHION: usize = 128 * 1024;

/// Default size of a thread-local allocation chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Configuration shared by the nexus, every execution context and the chunk
/// space.
///
/// # Example
///
/// ```
/// use strand_vm::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_chunk_size(64 * 1024)
///     .with_heap_limit(Some(16 * 1024 * 1024));
/// assert_eq!(config.chunk_size, 64 * 1024);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Native stack size used when it cannot be read from the platform.
    pub stack_size: usize,
    /// Bytes reserved below the usable stack for runtime bookkeeping.
    pub stack_cushion: usize,
    /// Bytes per thread-local allocation chunk.
    pub chunk_size: usize,
    /// Hard cap on bytes handed out by the chunk space. `None` is unbounded.
    pub heap_limit: Option<usize>,
    /// Bytes handed out since the last collection before one is requested.
    pub collect_threshold: usize,
    /// Retry budget for bounded waits.
    pub wait_limit: u32,
    /// Sleep between bounded-wait retries.
    pub wait_interval: Duration,
    /// Spinlock hold time above which a warning is logged.
    pub spin_hold_warning: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Create the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            stack_cushion: DEFAULT_STACK_CUSHION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            heap_limit: None,
            collect_threshold: 64 * 1024 * 1024,
            wait_limit: 100,
            wait_interval: Duration::from_micros(10),
            spin_hold_warning: Duration::from_micros(50),
        }
    }

    /// Set the fallback native stack size.
    #[must_use]
    pub const fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Set the stack cushion.
    #[must_use]
    pub const fn with_stack_cushion(mut self, cushion: usize) -> Self {
        self.stack_cushion = cushion;
        self
    }

    /// Set the chunk size.
    #[must_use]
    pub const fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the heap limit.
    #[must_use]
    pub const fn with_heap_limit(mut self, limit: Option<usize>) -> Self {
        self.heap_limit = limit;
        self
    }

    /// Set the allocation volume that triggers a collection request.
    #[must_use]
    pub const fn with_collect_threshold(mut self, bytes: usize) -> Self {
        self.collect_threshold = bytes;
        self
    }

    /// Set the bounded-wait retry budget.
    #[must_use]
    pub const fn with_wait_limit(mut self, limit: u32, interval: Duration) -> Self {
        self.wait_limit = limit;
        self.wait_interval = interval;
        self
    }
}
