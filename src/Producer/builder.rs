use std::sync::Arc;

use super::config::{ArbiterConfig, StallConfig};
use super::endpoint::ProducerEndpoint;
use super::shared_memory_arbiter::SharedMemoryArbiter;
use super::task_runner::TaskRunner;
use crate::error::{Error, Result};
use crate::Core::Abi::{PageLayout, ShmemMode};
use crate::Core::SharedMemory::{create_shared_memory, HeapSharedMemory, SharedMemoryBackend};

pub struct ArbiterBuilder {
    buffer_size: usize,
    config: ArbiterConfig,
    shm_name: Option<String>,
    shmem: Option<Arc<dyn SharedMemoryBackend>>,
}

impl Default for ArbiterBuilder {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024, // 256KB default
            config: ArbiterConfig::default(),
            shm_name: None,
            shmem: None,
        }
    }
}

impl ArbiterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    pub fn with_page_layout(mut self, layout: PageLayout) -> Self {
        self.config.page_layout = layout;
        self
    }

    pub fn with_shmem_mode(mut self, mode: ShmemMode) -> Self {
        self.config.shmem_mode = mode;
        self
    }

    pub fn with_batch_commits_duration_ms(mut self, duration_ms: u32) -> Self {
        self.config.batch_commits_duration_ms = duration_ms;
        self
    }

    pub fn with_stall_config(mut self, stall: StallConfig) -> Self {
        self.config.stall = stall;
        self
    }

    /// Maps the buffer from `/dev/shm/<name>` so another process can attach.
    pub fn with_shm_name(mut self, name: &str) -> Self {
        self.shm_name = Some(name.to_string());
        self
    }

    /// Uses an existing backend; the buffer size is taken from it.
    pub fn with_shared_memory(mut self, shmem: Arc<dyn SharedMemoryBackend>) -> Self {
        self.shmem = Some(shmem);
        self
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn build(self, endpoint: Arc<dyn ProducerEndpoint>, task_runner: Arc<dyn TaskRunner>) -> Result<Arc<SharedMemoryArbiter>> {
        let shmem = self.shared_memory()?;
        SharedMemoryArbiter::with_config(shmem, &self.config, Some((endpoint, task_runner)))
    }

    pub fn build_unbound(self) -> Result<Arc<SharedMemoryArbiter>> {
        let shmem = self.shared_memory()?;
        SharedMemoryArbiter::with_config(shmem, &self.config, None)
    }

    fn shared_memory(&self) -> Result<Arc<dyn SharedMemoryBackend>> {
        if let Some(shmem) = &self.shmem {
            return Ok(shmem.clone());
        }
        let page_size = self.config.page_size;
        if self.buffer_size < page_size {
            return Err(Error::BufferTooSmall {
                size: self.buffer_size,
                page_size,
            });
        }
        match &self.shm_name {
            Some(name) => {
                let shmem = create_shared_memory(self.buffer_size, Some(name)).map_err(|e| {
                    tracing::error!(name = %name, size = self.buffer_size, error = %e, "failed to create shared memory");
                    e
                })?;
                Ok(Arc::from(shmem))
            }
            None => Ok(Arc::new(HeapSharedMemory::new(self.buffer_size)?)),
        }
    }
}
