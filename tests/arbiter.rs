// Arbiter control flow: startup binding, shutdown, writer ids, flush acks,
// commit batching and the commit request wire format.
// Run with: cargo test --test arbiter -- --nocapture

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{bytes_field, harness, init_logging, pattern, HarnessOptions, PAGE_SIZE};
use dmxp_trace::Producer::commit_data_request::commit_data_request::{chunk_to_patch, ChunkToPatch, ChunksToMove};
use dmxp_trace::Producer::commit_data_request::CommitDataRequest;
use dmxp_trace::{
    ArbiterBuilder, ArbiterConfig, BufferExhaustedPolicy, Error, HeapSharedMemory, PageLayout, ProducerEndpoint,
    SharedMemoryArbiter, SharedMemoryBackend, TaskRunner, TraceWriter,
};
use dmxp_trace::testing::{FakeProducerEndpoint, TestTaskRunner};
use prost::Message as _;

/// Chunk size of a 4 KB page split in four.
const DIV4_CHUNK_SIZE: usize = 1020;

fn write_string_packet(writer: &mut dyn TraceWriter, text: &str) {
    let mut packet = writer.new_trace_packet();
    packet.append_string(1, text);
}

fn counting_callback(counter: &Arc<AtomicUsize>) -> Option<dmxp_trace::FlushCallback> {
    let counter = counter.clone();
    Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
}

#[test]
fn test_startup_writers_commit_after_binding() {
    init_logging();
    let h = harness(HarnessOptions {
        num_pages: 2,
        bound: false,
        ..HarnessOptions::default()
    });
    assert!(!h.arbiter.is_fully_bound());

    let acks = Arc::new(AtomicUsize::new(0));
    let mut w1 = h.arbiter.create_startup_trace_writer(1);
    let mut w2 = h.arbiter.create_startup_trace_writer(2);
    write_string_packet(w1.as_mut(), "early one");
    write_string_packet(w2.as_mut(), "early two");
    w1.flush(counting_callback(&acks));
    w2.flush(counting_callback(&acks));

    // Nothing can be sent before the endpoint exists.
    assert!(!h.arbiter.was_always_bound());
    assert_eq!(h.arbiter.bytes_pending_commit(), 2 * DIV4_CHUNK_SIZE);
    assert_eq!(acks.load(Ordering::SeqCst), 0);

    h.bind();
    assert!(!h.arbiter.is_fully_bound());
    assert_eq!(h.service.commit_count(), 0);

    h.arbiter.bind_startup_target_buffer(1, 7);
    // Reservation 2 is still open, the batch stays with the producer.
    assert_eq!(h.service.commit_count(), 0);
    assert_eq!(h.service.registered_writers(), vec![(w1.writer_id(), 7)]);

    h.arbiter.bind_startup_target_buffer(2, 8);
    assert!(h.arbiter.is_fully_bound());
    assert_eq!(h.service.commit_count(), 1);
    assert_eq!(acks.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.service.registered_writers(),
        vec![(w1.writer_id(), 7), (w2.writer_id(), 8)]
    );

    // Reservation placeholders were replaced by the bound buffers.
    let commit = h.service.last_commit().unwrap();
    let mut targets: Vec<u32> = commit.chunks_to_move.iter().map(|ctm| ctm.target_buffer()).collect();
    targets.sort_unstable();
    assert_eq!(targets, vec![7, 8]);

    let in_7 = h.service.packets_for_buffer(7);
    assert_eq!(in_7.len(), 1);
    assert_eq!(bytes_field(&in_7[0], 1).as_deref(), Some(&b"early one"[..]));
    let in_8 = h.service.packets_for_buffer(8);
    assert_eq!(bytes_field(&in_8[0], 1).as_deref(), Some(&b"early two"[..]));
}

#[test]
fn test_aborted_reservation_is_discarded() {
    let h = harness(HarnessOptions {
        bound: false,
        ..HarnessOptions::default()
    });
    let mut writer = h.arbiter.create_startup_trace_writer(3);
    write_string_packet(writer.as_mut(), "never seen");
    writer.flush(None);

    h.bind();
    h.arbiter.abort_startup_tracing_for_reservation(3);
    assert!(h.arbiter.is_fully_bound());

    assert_eq!(h.service.commit_count(), 1);
    assert_eq!(h.service.discarded_chunks(), 1);
    assert!(h.service.registered_writers().is_empty());
    assert!(h.service.chunks().is_empty());
}

#[test]
fn test_writer_for_resolved_reservation_targets_buffer() {
    let h = harness(HarnessOptions {
        bound: false,
        ..HarnessOptions::default()
    });
    let early = h.arbiter.create_startup_trace_writer(1);
    h.bind();
    h.arbiter.bind_startup_target_buffer(1, 5);
    drop(early);

    let mut late = h.arbiter.create_startup_trace_writer(1);
    let id = late.writer_id();
    write_string_packet(late.as_mut(), "late");
    late.flush(None);
    h.runner.run_until_idle();

    assert!(h.service.registered_writers().contains(&(id, 5)));
    let commit = h.service.last_commit().unwrap();
    assert!(commit.chunks_to_move.iter().all(|ctm| ctm.target_buffer() == 5));
    assert_eq!(h.service.packets_for_buffer(5).len(), 1);
}

#[test]
#[should_panic(expected = "resolved twice")]
fn test_reservation_cannot_be_bound_twice() {
    let h = harness(HarnessOptions {
        bound: false,
        ..HarnessOptions::default()
    });
    let _writer = h.arbiter.create_startup_trace_writer(1);
    h.bind();
    h.arbiter.bind_startup_target_buffer(1, 5);
    h.arbiter.bind_startup_target_buffer(1, 6);
}

#[test]
fn test_shutdown_hands_out_null_writers() {
    let h = harness(HarnessOptions::default());
    let writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    assert!(!h.arbiter.try_shutdown());
    drop(writer);
    assert!(h.arbiter.try_shutdown());

    let mut null = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    assert_eq!(null.writer_id(), 0);
    for i in 0..1000u64 {
        let mut packet = null.new_trace_packet();
        packet.append_varint(1, i);
        packet.append_bytes(2, &[0u8; 64]);
    }
    assert!(null.written() > 0);

    let acks = Arc::new(AtomicUsize::new(0));
    null.flush(counting_callback(&acks));
    assert_eq!(acks.load(Ordering::SeqCst), 1);

    h.runner.run_until_idle();
    let commits_before = h.service.commit_count();
    drop(null);
    h.runner.run_until_idle();
    assert_eq!(h.service.commit_count(), commits_before);
}

#[test]
fn test_writer_ids_round_robin() {
    let h = harness(HarnessOptions::default());
    let w1 = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    let w2 = h.arbiter.create_trace_writer(2, BufferExhaustedPolicy::Drop);
    let w3 = h.arbiter.create_trace_writer(3, BufferExhaustedPolicy::Drop);
    assert_eq!((w1.writer_id(), w2.writer_id(), w3.writer_id()), (1, 2, 3));

    drop(w2);
    // A released id is not handed out again right away.
    let w4 = h.arbiter.create_trace_writer(2, BufferExhaustedPolicy::Drop);
    assert_eq!(w4.writer_id(), 4);

    h.runner.run_until_idle();
    assert_eq!(h.service.registered_writers(), vec![(1, 1), (2, 2), (3, 3), (4, 2)]);
    assert_eq!(h.service.unregistered_writers(), vec![2]);
}

#[test]
fn test_flush_request_id_is_acknowledged() {
    let h = harness(HarnessOptions::default());
    h.arbiter.notify_flush_complete(42);
    h.arbiter.notify_flush_complete(40);
    assert_eq!(h.service.commit_count(), 0);

    h.runner.run_until_idle();
    assert_eq!(h.service.commit_count(), 1);
    assert_eq!(h.service.last_commit().unwrap().flush_request_id, Some(42));
}

#[test]
fn test_commits_are_batched() {
    let h = harness(HarnessOptions {
        config: ArbiterConfig {
            batch_commits_duration_ms: 100,
            ..ArbiterConfig::default()
        },
        ..HarnessOptions::default()
    });
    let mut writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    h.runner.run_until_idle();

    // 1500 bytes do not fit one chunk: the first one is returned mid-packet.
    {
        let mut packet = writer.new_trace_packet();
        packet.append_bytes(1, &pattern(1500, 4));
    }
    assert_eq!(h.arbiter.bytes_pending_commit(), DIV4_CHUNK_SIZE);
    assert_eq!(h.runner.next_task_due_ms(), Some(100));

    h.runner.run_until_idle();
    assert_eq!(h.runner.advance_time_and_run(99), 0);
    assert_eq!(h.service.commit_count(), 0);

    assert_eq!(h.runner.advance_time_and_run(1), 1);
    assert_eq!(h.service.commit_count(), 1);
    assert_eq!(h.service.last_commit().unwrap().chunks_to_move.len(), 1);
    assert_eq!(h.arbiter.bytes_pending_commit(), 0);

    // Without a batching delay the flush is due right away.
    h.arbiter.set_batch_commits_duration(0);
    {
        let mut packet = writer.new_trace_packet();
        packet.append_bytes(1, &pattern(1500, 5));
    }
    assert_eq!(h.runner.next_task_due_ms(), Some(h.runner.now_ms()));
    h.runner.run_until_idle();
    assert_eq!(h.service.commit_count(), 2);
}

#[test]
fn test_half_full_buffer_forces_commit() {
    let h = harness(HarnessOptions {
        config: ArbiterConfig {
            batch_commits_duration_ms: 10_000,
            ..ArbiterConfig::default()
        },
        ..HarnessOptions::default()
    });
    let mut writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    h.runner.run_until_idle();

    // Three returned chunks pass half of the four-chunk buffer.
    {
        let mut packet = writer.new_trace_packet();
        packet.append_bytes(1, &pattern(3500, 6));
    }
    assert_eq!(h.service.commit_count(), 0);
    h.runner.run_until_idle();
    assert_eq!(h.service.commit_count(), 1);
    assert_eq!(h.service.last_commit().unwrap().chunks_to_move.len(), 3);
}

#[test]
fn test_commit_request_wire_format() {
    let request = CommitDataRequest {
        chunks_to_move: vec![
            ChunksToMove {
                page: Some(0),
                chunk: Some(3),
                target_buffer: Some(7),
                data: None,
            },
            ChunksToMove {
                page: Some(2),
                chunk: Some(0),
                target_buffer: Some(8),
                data: Some(vec![1, 2, 3]),
            },
        ],
        chunks_to_patch: vec![ChunkToPatch {
            target_buffer: Some(7),
            writer_id: Some(1),
            chunk_id: Some(12),
            patches: vec![chunk_to_patch::Patch {
                offset: Some(5),
                data: Some(vec![0xD3, 0x8F, 0x80, 0x00]),
            }],
            has_more_patches: Some(true),
        }],
        flush_request_id: Some(99),
    };

    let bytes = request.encode_to_vec();
    let decoded = CommitDataRequest::decode(bytes.as_slice()).unwrap();
    assert_eq!(decoded, request);

    // Field 3 (flush_request_id) is the last thing on the wire: tag 0x18, value 99.
    assert_eq!(&bytes[bytes.len() - 2..], &[0x18, 99]);
    assert_eq!(CommitDataRequest::default().encode_to_vec(), Vec::<u8>::new());
}

#[test]
fn test_builder_geometry() {
    let err = ArbiterBuilder::new().with_buffer_size(1024).build_unbound().unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { size: 1024, page_size: 4096 }));

    let err = ArbiterBuilder::new().with_buffer_size(5000).build_unbound().unwrap_err();
    assert!(matches!(err, Error::InvalidGeometry { .. }));

    let err = ArbiterBuilder::new()
        .with_page_layout(PageLayout::NotPartitioned)
        .build_unbound()
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));

    let arbiter = ArbiterBuilder::new()
        .with_buffer_size(16 * PAGE_SIZE)
        .with_page_layout(PageLayout::Div7)
        .build_unbound()
        .unwrap();
    assert_eq!(arbiter.abi().num_pages(), 16);
    assert_eq!(arbiter.page_layout(), PageLayout::Div7);
    assert!(!arbiter.is_fully_bound());
}

#[test]
fn test_builder_with_existing_shared_memory() {
    let shmem: Arc<dyn SharedMemoryBackend> = Arc::new(HeapSharedMemory::new(4 * PAGE_SIZE).unwrap());
    let service = FakeProducerEndpoint::new(shmem.clone(), PAGE_SIZE).unwrap();
    let runner = Arc::new(TestTaskRunner::new());

    let arbiter: Arc<SharedMemoryArbiter> = ArbiterBuilder::new()
        .with_shared_memory(shmem)
        .with_page_layout(PageLayout::Div2)
        .build(service.clone() as Arc<dyn ProducerEndpoint>, runner.clone() as Arc<dyn TaskRunner>)
        .unwrap();
    assert!(arbiter.is_fully_bound());

    let mut writer = arbiter.create_trace_writer(9, BufferExhaustedPolicy::Stall);
    write_string_packet(writer.as_mut(), "via builder");
    writer.flush(None);
    runner.run_until_idle();
    assert_eq!(service.registered_writers(), vec![(writer.writer_id(), 9)]);
    assert_eq!(service.packets_for_buffer(9).len(), 1);
}

#[test]
fn test_arbiter_debug_output() {
    let h = harness(HarnessOptions::default());
    let _writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    let out = format!("{:?}", h.arbiter);
    println!("{}", out);
    assert!(out.contains("SharedMemoryArbiter"));
    assert!(out.contains("fully_bound: true"));
    assert!(out.contains("page_size: 4096"));
}
