use super::basic_types::{BufferId, FlushCallback, WriterId};
use super::commit_data_request::CommitDataRequest;

/// The producer's connection to the tracing service.
///
/// The arbiter only calls it from its task runner thread and never while
/// holding its own lock, so implementations may call back into the arbiter.
pub trait ProducerEndpoint: Send + Sync {
    /// Hands over completed chunks and patches. `callback` runs once the
    /// service has processed the request.
    fn commit_data(&self, request: CommitDataRequest, callback: Option<FlushCallback>);

    fn register_trace_writer(&self, writer_id: WriterId, target_buffer: BufferId);

    fn unregister_trace_writer(&self, writer_id: WriterId);
}
