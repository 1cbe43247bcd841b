pub mod basic_types;
pub mod builder;
pub mod commit_data_request;
pub mod config;
mod debug;
pub mod endpoint;
pub mod garbage;
pub mod null_trace_writer;
pub mod shared_memory_arbiter;
pub mod task_runner;
pub mod trace_packet;
pub mod trace_writer;

pub use basic_types::{
    BufferExhaustedPolicy, BufferId, ChunkId, FlushCallback, FlushRequestId, MaybeUnboundBufferId, WriterId,
    INVALID_BUFFER_ID, MAX_WRITER_ID,
};
pub use builder::ArbiterBuilder;
pub use commit_data_request::CommitDataRequest;
pub use config::{ArbiterConfig, StallConfig};
pub use endpoint::ProducerEndpoint;
pub use null_trace_writer::NullTraceWriter;
pub use shared_memory_arbiter::{ArbiterStats, SharedMemoryArbiter};
pub use task_runner::{Task, TaskRunner, ThreadTaskRunner};
pub use trace_packet::TracePacket;
pub use trace_writer::{TraceWriter, TraceWriterImpl};
