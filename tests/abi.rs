// Page/chunk state machine tests for SharedMemoryAbi.
// Run with: cargo test --test abi -- --nocapture

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use dmxp_trace::Core::Abi::layout::{ChunkHeaderInit, CHUNK_HEADER_SIZE, PAGE_HEADER_SIZE};
use dmxp_trace::Core::SharedMemory::{HeapSharedMemory, SharedMemoryBackend};
use dmxp_trace::{ChunkState, Error, PageLayout, Packets, SharedMemoryAbi, ShmemMode};

const PAGE_SIZE: usize = 4096;

fn new_abi(num_pages: usize, mode: ShmemMode) -> (HeapSharedMemory, SharedMemoryAbi) {
    let shm = HeapSharedMemory::new(PAGE_SIZE * num_pages).unwrap();
    let abi = unsafe { SharedMemoryAbi::new(shm.as_ptr(), shm.size(), PAGE_SIZE, mode).unwrap() };
    (shm, abi)
}

fn header(writer_id: u16, chunk_id: u32) -> ChunkHeaderInit {
    ChunkHeaderInit {
        writer_id,
        chunk_id,
        packets: Packets::default(),
    }
}

#[test]
fn test_geometry_validation() {
    let shm = HeapSharedMemory::new(3 * PAGE_SIZE).unwrap();
    let abi = unsafe { SharedMemoryAbi::new(shm.as_ptr(), shm.size(), PAGE_SIZE, ShmemMode::Default) };
    assert_eq!(abi.unwrap().num_pages(), 3);

    // Page size must be a multiple of 4 KB, at most 64 KB.
    let bad_page = unsafe { SharedMemoryAbi::new(shm.as_ptr(), shm.size(), 1000, ShmemMode::Default) };
    assert!(matches!(bad_page, Err(Error::InvalidPageSize(1000))));
    let too_big = unsafe { SharedMemoryAbi::new(shm.as_ptr(), shm.size(), 128 * 1024, ShmemMode::Default) };
    assert!(matches!(too_big, Err(Error::InvalidPageSize(_))));

    // Buffer must be a whole number of pages.
    let odd_size = unsafe { SharedMemoryAbi::new(shm.as_ptr(), PAGE_SIZE + 100, PAGE_SIZE, ShmemMode::Default) };
    assert!(matches!(odd_size, Err(Error::InvalidGeometry { .. })));

    let misaligned = unsafe { SharedMemoryAbi::new(shm.as_ptr().add(8), PAGE_SIZE, PAGE_SIZE, ShmemMode::Default) };
    assert!(matches!(misaligned, Err(Error::Misaligned(_))));
}

#[test]
fn test_partition_and_acquire() {
    let (_shm, abi) = new_abi(2, ShmemMode::Default);
    assert!(abi.is_page_free(0));
    assert_eq!(abi.get_page_layout(0), PageLayout::NotPartitioned);

    // Test 1: partitioning claims the page once
    assert!(abi.try_partition_page(0, PageLayout::Div4));
    assert!(!abi.try_partition_page(0, PageLayout::Div2));
    assert_eq!(abi.get_page_layout(0), PageLayout::Div4);
    assert_eq!(abi.get_free_chunks(0), 0b1111);
    assert!(!abi.is_page_free(0));

    // Test 2: acquiring stamps the header
    let chunk = abi.try_acquire_chunk_for_writing(0, 2, &header(7, 42)).unwrap();
    assert_eq!(chunk.chunk_idx(), 2);
    assert_eq!(chunk.size(), 1020);
    assert_eq!(chunk.payload_size(), 1020 - CHUNK_HEADER_SIZE);
    assert_eq!(chunk.writer_id(), 7);
    assert_eq!(chunk.chunk_id(), 42);
    assert_eq!(chunk.packets(), Packets::default());
    let expected_begin = unsafe { abi.start().add(PAGE_HEADER_SIZE + 2 * 1020) };
    assert_eq!(chunk.begin(), expected_begin);
    assert_eq!(abi.get_page_and_chunk_index(&chunk), (0, 2));

    // Test 3: the chunk cannot be acquired twice
    assert!(abi.try_acquire_chunk_for_writing(0, 2, &header(8, 0)).is_none());
    assert_eq!(abi.get_chunk_state(0, 2), ChunkState::BeingWritten);
    assert_eq!(abi.get_free_chunks(0), 0b1011);

    // Test 4: out of range chunk index for the layout
    assert!(abi.try_acquire_chunk_for_writing(0, 5, &header(7, 0)).is_none());
    // Unpartitioned page has no chunks
    assert!(abi.try_acquire_chunk_for_writing(1, 0, &header(7, 0)).is_none());

    drop(chunk);
}

#[test]
fn test_full_chunk_lifecycle_departitions_page() {
    let (_shm, abi) = new_abi(1, ShmemMode::Default);
    assert!(abi.try_partition_page(0, PageLayout::Div2));

    let a = abi.try_acquire_chunk_for_writing(0, 0, &header(1, 0)).unwrap();
    let b = abi.try_acquire_chunk_for_writing(0, 1, &header(1, 1)).unwrap();

    // Reading a chunk that is still being written fails.
    assert!(abi.try_acquire_chunk_for_reading(0, 0).is_none());

    assert_eq!(abi.release_chunk_as_complete(a), 0);
    assert_eq!(abi.get_chunk_state(0, 0), ChunkState::Complete);
    assert!(!abi.is_page_complete(0));
    abi.release_chunk_as_complete(b);
    assert!(abi.is_page_complete(0));

    let a = abi.try_acquire_chunk_for_reading(0, 0).unwrap();
    assert_eq!(abi.get_chunk_state(0, 0), ChunkState::BeingRead);
    assert_eq!(a.writer_id(), 1);
    abi.release_chunk_as_free(a);
    assert_eq!(abi.get_page_layout(0), PageLayout::Div2);

    // Freeing the last chunk makes the page unpartitioned again.
    let b = abi.try_acquire_chunk_for_reading(0, 1).unwrap();
    abi.release_chunk_as_free(b);
    assert!(abi.is_page_free(0));
    assert_eq!(abi.get_page_header_bitmap(0), 0);

    // And it can be re-partitioned with another layout.
    assert!(abi.try_partition_page(0, PageLayout::Div14));
    assert_eq!(abi.get_free_chunks(0), (1 << 14) - 1);
}

#[test]
#[should_panic(expected = "unexpected state")]
fn test_complete_to_free_requires_emulation() {
    let (_shm, abi) = new_abi(1, ShmemMode::Default);
    assert!(abi.try_partition_page(0, PageLayout::Div1));
    let chunk = abi.try_acquire_chunk_for_writing(0, 0, &header(1, 0)).unwrap();
    abi.release_chunk_as_complete(chunk);
    let bitmap = abi.get_page_header_bitmap(0);
    let chunk = unsafe { abi.get_chunk_unchecked(0, bitmap, 0) };
    abi.release_chunk_as_free(chunk);
}

#[test]
fn test_emulation_frees_complete_chunks() {
    let (_shm, abi) = new_abi(1, ShmemMode::Emulation);
    assert!(abi.try_partition_page(0, PageLayout::Div1));
    let chunk = abi.try_acquire_chunk_for_writing(0, 0, &header(1, 0)).unwrap();
    abi.release_chunk_as_complete(chunk);

    let bitmap = abi.get_page_header_bitmap(0);
    let chunk = unsafe { abi.get_chunk_unchecked(0, bitmap, 0) };
    abi.release_chunk_as_free(chunk);
    assert!(abi.is_page_free(0));
}

#[test]
fn test_chunk_header_mutation() {
    let (_shm, abi) = new_abi(1, ShmemMode::Default);
    assert!(abi.try_partition_page(0, PageLayout::Div7));
    let mut chunk = abi.try_acquire_chunk_for_writing(0, 6, &header(3, 9)).unwrap();

    assert_eq!(chunk.increment_packet_count(), 1);
    assert_eq!(chunk.increment_packet_count(), 2);
    chunk.set_flag(Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK);
    chunk.set_flag(Packets::CHUNK_NEEDS_PATCHING);
    assert_eq!(chunk.packets().count, 2);
    assert_eq!(
        chunk.packets().flags,
        Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK | Packets::CHUNK_NEEDS_PATCHING
    );

    chunk.clear_needs_patching_flag();
    assert_eq!(chunk.packets().flags, Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK);
    assert!(chunk.end() as usize <= abi.start() as usize + PAGE_SIZE);

    let debug = format!("{:?}", chunk);
    println!("{}", debug);
    assert!(debug.contains("writer_id: 3"));
    abi.release_chunk_as_complete(chunk);
}

#[test]
fn test_stats() {
    let (_shm, abi) = new_abi(3, ShmemMode::Default);
    assert!(abi.try_partition_page(1, PageLayout::Div4));
    let a = abi.try_acquire_chunk_for_writing(1, 0, &header(1, 0)).unwrap();
    let b = abi.try_acquire_chunk_for_writing(1, 1, &header(1, 1)).unwrap();
    abi.release_chunk_as_complete(b);

    let stats = abi.get_stats();
    println!("{:?}", stats);
    assert_eq!(stats.pages_free, 2);
    assert_eq!(stats.chunks_being_written, 1);
    assert_eq!(stats.chunks_complete, 1);
    assert_eq!(stats.chunks_free, 2);
    assert_eq!(stats.chunks_being_read, 0);
    assert_eq!(stats.pages_unexpected, 0);
    drop(a);
}

#[test]
fn test_concurrent_acquire_is_exclusive() {
    let num_pages = 4;
    let shm = Arc::new(HeapSharedMemory::new(PAGE_SIZE * num_pages).unwrap());
    let abi = Arc::new(unsafe {
        SharedMemoryAbi::new(shm.as_ptr(), shm.size(), PAGE_SIZE, ShmemMode::Default).unwrap()
    });
    let acquired = Arc::new(AtomicUsize::new(0));
    let num_threads = 8;

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let abi = abi.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                let mut mine = Vec::new();
                for page in 0..num_pages {
                    if abi.is_page_free(page) {
                        abi.try_partition_page(page, PageLayout::Div14);
                    }
                    for idx in 0..14 {
                        if let Some(chunk) = abi.try_acquire_chunk_for_writing(page, idx, &header(t as u16 + 1, 0)) {
                            mine.push(abi.get_page_and_chunk_index(&chunk));
                            acquired.fetch_add(1, Ordering::Relaxed);
                            abi.release_chunk_as_complete(chunk);
                        }
                    }
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for slot in handle.join().unwrap() {
            assert!(seen.insert(slot), "chunk {:?} acquired twice", slot);
        }
    }
    // Every chunk went to exactly one thread.
    assert_eq!(acquired.load(Ordering::Relaxed), num_pages * 14);
    assert_eq!(abi.get_stats().chunks_complete, num_pages * 14);
}

#[test]
fn test_concurrent_release_keeps_other_chunk_states() {
    let (shm, abi) = new_abi(1, ShmemMode::Default);
    let abi = Arc::new(abi);
    assert!(abi.try_partition_page(0, PageLayout::Div14));

    // Chunks 0..7 are written and completed by producers while the "service"
    // reads and frees chunks 7..14 on another thread.
    for idx in 7..14 {
        let chunk = abi.try_acquire_chunk_for_writing(0, idx, &header(1, idx as u32)).unwrap();
        abi.release_chunk_as_complete(chunk);
    }

    let service = {
        let abi = abi.clone();
        thread::spawn(move || {
            for idx in 7..14 {
                let chunk = abi.try_acquire_chunk_for_reading(0, idx).unwrap();
                abi.release_chunk_as_free(chunk);
            }
        })
    };
    for idx in 0..7 {
        let chunk = abi.try_acquire_chunk_for_writing(0, idx, &header(2, idx as u32)).unwrap();
        abi.release_chunk_as_complete(chunk);
    }
    service.join().unwrap();

    for idx in 0..7 {
        assert_eq!(abi.get_chunk_state(0, idx), ChunkState::Complete);
    }
    for idx in 7..14 {
        assert_eq!(abi.get_chunk_state(0, idx), ChunkState::Free);
    }
    drop(shm);
}
