//! Resource configuration shared by the encoding and decoding pipelines.

/// Memory and parallelism limits for streaming operations.
///
/// The same budget bounds both directions: the encoder sizes its channel
/// batches so that two in-flight batches fit in `memory_budget`, and the
/// decoder refuses any window whose compressed byte length exceeds it.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Soft memory budget in bytes for batch/window buffers.
    pub memory_budget: usize,
    /// Number of codec worker threads per operation.
    pub workers: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            memory_budget: 256 * 1024 * 1024,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl StreamConfig {
    /// Override the memory budget.
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Override the worker count (clamped to at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}
