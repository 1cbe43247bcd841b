use crate::Core::Abi::{PageLayout, ShmemMode};

/// Backoff shape used while a writer waits for a free chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallConfig {
    /// Upper bound of the sleep between two scans of the buffer.
    pub max_stall_interval_us: u64,
    /// Stalls tolerated before the wait is logged.
    pub log_after_n_stalls: u32,
    /// Every Nth stall flushes pending commits instead of sleeping (only when
    /// stalling on the task runner thread, where nobody else could flush).
    pub flush_commits_after_every_n_stalls: u32,
    /// Stalls after which `Stall` panics and `StallThenDrop` drops.
    pub assert_at_n_stalls: u32,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            max_stall_interval_us: 100_000,
            log_after_n_stalls: 3,
            flush_commits_after_every_n_stalls: 2,
            assert_at_n_stalls: 200,
        }
    }
}

/// Geometry and behaviour of an arbiter, see `ArbiterBuilder` for defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbiterConfig {
    pub page_size: usize,
    pub shmem_mode: ShmemMode,
    /// Layout used when a free page is partitioned.
    pub page_layout: PageLayout,
    /// Delay before a batch of completed chunks is committed.
    pub batch_commits_duration_ms: u32,
    pub stall: StallConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * 1024,
            shmem_mode: ShmemMode::Default,
            page_layout: PageLayout::Div1,
            batch_commits_duration_ms: 0,
            stall: StallConfig::default(),
        }
    }
}
