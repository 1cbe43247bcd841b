// In demos/producer.rs
//
// Writer threads push hashed messages through the arbiter into a shared
// buffer; an in-process service drains it on the task runner thread and the
// packets are checked against their hashes at the end.
//
//   cargo run --example producer -- 10000 4
//   cargo run --example producer -- 10000 4 --shm dmxp_trace_demo
use dmxp_trace::testing::{parse_fields, FakeProducerEndpoint, FieldValue};
use dmxp_trace::{
    create_shared_memory, ArbiterBuilder, BufferExhaustedPolicy, HeapSharedMemory, PageLayout, ProducerEndpoint,
    SharedMemoryBackend, TaskRunner, ThreadTaskRunner,
};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PAGE_SIZE: usize = 4096;
const BUFFER_SIZE: usize = 256 * 1024;

fn hash_hex(i: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{}", i).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages> [num_threads] [--shm <name>]", args[0]);
        std::process::exit(1);
    }
    let num_messages: usize = args[1].parse().expect("Invalid number of messages");
    let num_threads: usize = args
        .get(2)
        .filter(|s| !s.starts_with("--"))
        .map(|s| s.parse().expect("Invalid number of threads"))
        .unwrap_or(4);
    let shm_name = args
        .iter()
        .position(|s| s == "--shm")
        .and_then(|i| args.get(i + 1))
        .cloned();

    println!("Producer: Precomputing {} hashes...", num_messages);
    let start_precompute = Instant::now();
    let hashes: Arc<Vec<String>> = Arc::new((0..num_messages).map(hash_hex).collect());
    println!(
        "Producer: Precomputed {} hashes in {:.2?}",
        num_messages,
        start_precompute.elapsed()
    );

    let shmem: Arc<dyn SharedMemoryBackend> = match &shm_name {
        Some(name) => Arc::from(create_shared_memory(BUFFER_SIZE, Some(name))?),
        None => Arc::new(HeapSharedMemory::new(BUFFER_SIZE)?),
    };
    let service = FakeProducerEndpoint::new(shmem.clone(), PAGE_SIZE)?;
    let runner = ThreadTaskRunner::spawn("dmxp-commit")?;
    let arbiter = ArbiterBuilder::new()
        .with_shared_memory(shmem)
        .with_page_size(PAGE_SIZE)
        .with_page_layout(PageLayout::Div4)
        .with_batch_commits_duration_ms(5)
        .build(
            service.clone() as Arc<dyn ProducerEndpoint>,
            runner.clone() as Arc<dyn TaskRunner>,
        )?;
    println!("Producer: {:?}", arbiter);

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_for_handler = Arc::clone(&keep_running);
    // Handle Ctrl+C to stop the writers early
    ctrlc::set_handler(move || {
        keep_running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let next_message = Arc::new(AtomicUsize::new(0));
    let start_send = Instant::now();
    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let arbiter = arbiter.clone();
            let hashes = hashes.clone();
            let next_message = next_message.clone();
            let keep_running = keep_running.clone();
            thread::spawn(move || {
                let mut writer = arbiter.create_trace_writer(1, BufferExhaustedPolicy::StallThenDrop);
                let mut sent = 0usize;
                while keep_running.load(Ordering::Relaxed) {
                    let i = next_message.fetch_add(1, Ordering::Relaxed);
                    if i >= hashes.len() {
                        break;
                    }
                    let mut packet = writer.new_trace_packet();
                    packet.append_varint(1, i as u64);
                    packet.append_string(2, &hashes[i]);
                    drop(packet);
                    sent += 1;
                    if sent % 1000 == 0 {
                        println!("Writer {}: sent {} messages", t, sent);
                    }
                }

                let (tx, rx) = mpsc::channel();
                writer.flush(Some(Box::new(move || {
                    let _ = tx.send(());
                })));
                if rx.recv_timeout(Duration::from_secs(5)).is_err() {
                    eprintln!("Writer {}: flush was not acknowledged", t);
                }
                (sent, writer.drop_count())
            })
        })
        .collect();

    let mut sent = 0;
    let mut drops = 0;
    for handle in handles {
        let (n, d) = handle.join().expect("writer thread panicked");
        sent += n;
        drops += d;
    }
    let send_time = start_send.elapsed();
    println!("Producer: Sent {} messages in {:.2?} ({} drop episodes)", sent, send_time, drops);
    println!(
        "Producer: Throughput: {:.2} messages/sec",
        sent as f64 / send_time.as_secs_f64()
    );

    let packets = service.packets_for_buffer(1);
    let mut verified = 0;
    let mut mismatched = 0;
    for packet in &packets {
        let Some(fields) = parse_fields(packet) else {
            mismatched += 1;
            continue;
        };
        let index = fields.iter().find_map(|(id, v)| match v {
            FieldValue::Varint(i) if *id == 1 => Some(*i as usize),
            _ => None,
        });
        let hash = fields.iter().find_map(|(id, v)| match v {
            FieldValue::Bytes(b) if *id == 2 => Some(b.as_slice()),
            _ => None,
        });
        match (index, hash) {
            (Some(i), Some(h)) if i < hashes.len() && hash_hex(i).as_bytes() == h => verified += 1,
            _ => mismatched += 1,
        }
    }
    println!(
        "Service: {} commits, {} packets verified, {} mismatched, {} missing chunks",
        service.commit_count(),
        verified,
        mismatched,
        service.missing_chunks()
    );
    println!("Producer: {:?}", arbiter.get_stats());

    runner.shutdown();
    println!("Producer: Shutting down");
    Ok(())
}
