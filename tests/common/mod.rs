// Shared setup for the producer tests: a heap-backed buffer, the fake service
// reading from it and a manually driven task runner owned by the test thread.
#![allow(dead_code)]

use std::sync::Arc;

use dmxp_trace::testing::{parse_fields, FakeProducerEndpoint, FieldValue, TestTaskRunner};
use dmxp_trace::Core::SharedMemory::{HeapSharedMemory, SharedMemoryBackend};
use dmxp_trace::Producer::{ArbiterConfig, ProducerEndpoint, SharedMemoryArbiter, TaskRunner};
use dmxp_trace::{PageLayout, ShmemMode};

pub const PAGE_SIZE: usize = 4096;

/// Routes the crate's tracing output to the test harness.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct Harness {
    pub runner: Arc<TestTaskRunner>,
    pub service: Arc<FakeProducerEndpoint>,
    pub arbiter: Arc<SharedMemoryArbiter>,
}

pub struct HarnessOptions {
    pub num_pages: usize,
    pub layout: PageLayout,
    pub shmem_mode: ShmemMode,
    pub bound: bool,
    pub config: ArbiterConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            num_pages: 1,
            layout: PageLayout::Div4,
            shmem_mode: ShmemMode::Default,
            bound: true,
            config: ArbiterConfig::default(),
        }
    }
}

pub fn harness(options: HarnessOptions) -> Harness {
    let shmem: Arc<dyn SharedMemoryBackend> =
        Arc::new(HeapSharedMemory::new(PAGE_SIZE * options.num_pages).unwrap());
    let service = FakeProducerEndpoint::new(shmem.clone(), PAGE_SIZE).unwrap();
    let runner = Arc::new(TestTaskRunner::new());

    let config = ArbiterConfig {
        page_size: PAGE_SIZE,
        page_layout: options.layout,
        shmem_mode: options.shmem_mode,
        ..options.config
    };
    let binding = options.bound.then(|| {
        (
            service.clone() as Arc<dyn ProducerEndpoint>,
            runner.clone() as Arc<dyn TaskRunner>,
        )
    });
    let arbiter = SharedMemoryArbiter::with_config(shmem, &config, binding).unwrap();
    Harness {
        runner,
        service,
        arbiter,
    }
}

impl Harness {
    pub fn bind(&self) {
        self.arbiter.bind_to_producer_endpoint(
            self.service.clone() as Arc<dyn ProducerEndpoint>,
            self.runner.clone() as Arc<dyn TaskRunner>,
        );
    }
}

/// The bytes of length-delimited `field_id` in a serialized message.
pub fn bytes_field(packet: &[u8], field_id: u32) -> Option<Vec<u8>> {
    parse_fields(packet)?.into_iter().find_map(|(id, value)| match value {
        FieldValue::Bytes(bytes) if id == field_id => Some(bytes),
        _ => None,
    })
}

pub fn varint_field(packet: &[u8], field_id: u32) -> Option<u64> {
    parse_fields(packet)?.into_iter().find_map(|(id, value)| match value {
        FieldValue::Varint(v) if id == field_id => Some(v),
        _ => None,
    })
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
