// Allocation tracking for the packet write path.
//
// Note: every test here is marked with #[serial_test::serial]: dhat only
// allows one profiler at a time and counts allocations from all threads.
//
// # Run all allocation tracking tests
// cargo test --test allocation_tracking -- --nocapture

mod common;

use common::{harness, HarnessOptions};
use dmxp_trace::{BufferExhaustedPolicy, TraceWriter};

#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

fn write_small_packet(writer: &mut dyn TraceWriter, i: u64) {
    let mut packet = writer.new_trace_packet();
    packet.append_varint(1, i);
    let mut nested = packet.begin_nested(3);
    nested.append_string(1, "ev");
    nested.append_fixed64(2, i * 3);
}

#[test]
#[serial_test::serial]
fn test_packets_within_a_chunk_do_not_allocate() {
    println!("\n--- Writing packets into an acquired chunk with dhat ---");
    let _profiler = dhat::Profiler::new_heap();

    let h = harness(HarnessOptions::default());
    let mut writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    // First packet acquires the chunk.
    write_small_packet(writer.as_mut(), 0);

    let before = dhat::HeapStats::get();
    for i in 1..40 {
        write_small_packet(writer.as_mut(), i);
    }
    let after = dhat::HeapStats::get();
    println!("blocks before: {}, after: {}", before.total_blocks, after.total_blocks);

    // Nested messages live in the arena's first block, encoding goes straight to shared memory.
    assert_eq!(after.total_blocks, before.total_blocks);
    assert_eq!(h.service.commit_count(), 0);

    writer.flush(None);
    assert_eq!(h.service.packets_for_writer(writer.writer_id()).len(), 40);
}

#[test]
#[serial_test::serial]
fn test_chunk_switch_allocations_are_bounded() {
    println!("\n--- Switching chunks with dhat ---");
    let _profiler = dhat::Profiler::new_heap();

    let h = harness(HarnessOptions {
        num_pages: 4,
        ..HarnessOptions::default()
    });
    let mut writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    let payload = vec![0x42u8; 700];
    {
        let mut packet = writer.new_trace_packet();
        packet.append_bytes(1, &payload);
    }

    let before = dhat::HeapStats::get();
    for _ in 0..10 {
        let mut packet = writer.new_trace_packet();
        packet.append_bytes(1, &payload);
    }
    let after = dhat::HeapStats::get();
    let blocks = after.total_blocks - before.total_blocks;
    println!("allocated {} blocks over 10 packets spanning chunks", blocks);

    // Only the commit bookkeeping allocates, never per byte written.
    assert!(blocks < 64, "unexpected allocation count: {}", blocks);
}

#[test]
#[serial_test::serial]
fn test_write_path_with_memory_stats() {
    println!("\n--- Writing packets with memory-stats ---");
    use memory_stats::memory_stats;

    let h = harness(HarnessOptions {
        num_pages: 16,
        ..HarnessOptions::default()
    });
    let before = memory_stats();
    println!("Memory before: {:?}", before);

    let mut writer = h.arbiter.create_trace_writer(1, BufferExhaustedPolicy::Drop);
    for round in 0..100u64 {
        for i in 0..50 {
            write_small_packet(writer.as_mut(), round * 50 + i);
        }
        writer.flush(None);
    }
    h.runner.run_until_idle();

    let after = memory_stats();
    println!("Memory after: {:?}", after);
    if let (Some(b), Some(a)) = (before, after) {
        let delta = a.physical_mem as i64 - b.physical_mem as i64;
        println!("Memory delta: {} bytes ({:.2} KB)", delta, delta as f64 / 1024.0);
    }
    assert_eq!(writer.drop_count(), 0);
    assert_eq!(h.service.packets_for_writer(writer.writer_id()).len(), 5000);
}
