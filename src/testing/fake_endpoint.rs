// In-process stand-in for the tracing service: records what the producer
// sends, copies committed chunks out of the buffer, applies patches and
// reassembles packets per writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::Core::Abi::layout::{Packets, CHUNK_HEADER_SIZE, PACKET_SIZE_DROP_PACKET};
use crate::Core::Abi::{SharedMemoryAbi, ShmemMode};
use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::Producer::basic_types::{BufferId, ChunkId, FlushCallback, WriterId};
use crate::Producer::commit_data_request::commit_data_request::{ChunkToPatch, ChunksToMove};
use crate::Producer::commit_data_request::CommitDataRequest;
use crate::Producer::endpoint::ProducerEndpoint;
use crate::Proto::proto_utils::parse_varint;

/// A chunk as the service received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub target_buffer: u32,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
    pub packets: Packets,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct ServiceState {
    commits: Vec<CommitDataRequest>,
    backlog: Vec<CommitDataRequest>,
    paused: bool,
    registered: Vec<(WriterId, BufferId)>,
    unregistered: Vec<WriterId>,
    chunks: BTreeMap<(WriterId, ChunkId), StoredChunk>,
    discarded_chunks: usize,
    missing_chunks: usize,
    callbacks_run: usize,
}

pub struct FakeProducerEndpoint {
    shmem: Arc<dyn SharedMemoryBackend>,
    abi: SharedMemoryAbi,
    state: Mutex<ServiceState>,
}

impl FakeProducerEndpoint {
    /// A service reading chunks in place from `shmem`.
    pub fn new(shmem: Arc<dyn SharedMemoryBackend>, page_size: usize) -> Result<Arc<Self>> {
        let abi = unsafe { SharedMemoryAbi::new(shmem.as_ptr(), shmem.size(), page_size, ShmemMode::Default)? };
        Ok(Arc::new(Self {
            shmem,
            abi,
            state: Mutex::new(ServiceState::default()),
        }))
    }

    pub fn shared_memory(&self) -> &Arc<dyn SharedMemoryBackend> {
        &self.shmem
    }

    /// While paused, commits are recorded but their chunks stay Complete in
    /// the buffer, like a service that stopped draining.
    pub fn set_paused(&self, paused: bool) {
        let backlog = {
            let mut state = self.state.lock();
            state.paused = paused;
            if paused {
                return;
            }
            std::mem::take(&mut state.backlog)
        };
        let mut state = self.state.lock();
        for request in &backlog {
            self.consume(&mut state, request);
        }
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits.len()
    }

    pub fn commits(&self) -> Vec<CommitDataRequest> {
        self.state.lock().commits.clone()
    }

    pub fn last_commit(&self) -> Option<CommitDataRequest> {
        self.state.lock().commits.last().cloned()
    }

    pub fn registered_writers(&self) -> Vec<(WriterId, BufferId)> {
        self.state.lock().registered.clone()
    }

    pub fn unregistered_writers(&self) -> Vec<WriterId> {
        self.state.lock().unregistered.clone()
    }

    pub fn callbacks_run(&self) -> usize {
        self.state.lock().callbacks_run
    }

    /// Chunks committed to buffer 0 (aborted startup tracing).
    pub fn discarded_chunks(&self) -> usize {
        self.state.lock().discarded_chunks
    }

    /// Chunk references that did not point at a Complete chunk.
    pub fn missing_chunks(&self) -> usize {
        self.state.lock().missing_chunks
    }

    pub fn chunks(&self) -> Vec<StoredChunk> {
        self.state.lock().chunks.values().cloned().collect()
    }

    pub fn chunk(&self, writer_id: WriterId, chunk_id: ChunkId) -> Option<StoredChunk> {
        self.state.lock().chunks.get(&(writer_id, chunk_id)).cloned()
    }

    /// Complete packets of `writer_id` in writing order. Packets whose
    /// fragments are missing or marked as dropped are skipped, and so are
    /// zero-size fragments (padding behind an inflated packet count).
    pub fn packets_for_writer(&self, writer_id: WriterId) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let chunks = state
            .chunks
            .range((writer_id, 0)..=(writer_id, ChunkId::MAX))
            .map(|(_, chunk)| chunk);
        reassemble(chunks)
    }

    /// Complete packets of every writer that committed to `buffer_id`,
    /// grouped by writer id.
    pub fn packets_for_buffer(&self, buffer_id: BufferId) -> Vec<Vec<u8>> {
        let writers: Vec<WriterId> = {
            let state = self.state.lock();
            let mut ids: Vec<WriterId> = state
                .chunks
                .values()
                .filter(|chunk| chunk.target_buffer == buffer_id as u32)
                .map(|chunk| chunk.writer_id)
                .collect();
            ids.dedup();
            ids
        };
        writers
            .into_iter()
            .flat_map(|writer_id| self.packets_for_writer(writer_id))
            .collect()
    }

    fn consume(&self, state: &mut ServiceState, request: &CommitDataRequest) {
        for ctm in &request.chunks_to_move {
            self.copy_chunk(state, ctm);
        }
        for ctp in &request.chunks_to_patch {
            Self::apply_patches(state, ctp);
        }
    }

    fn copy_chunk(&self, state: &mut ServiceState, ctm: &ChunksToMove) {
        let stored = match &ctm.data {
            Some(data) => match parse_chunk_copy(data, ctm.target_buffer()) {
                Some(stored) => stored,
                None => {
                    state.missing_chunks += 1;
                    return;
                }
            },
            None => {
                let Some(chunk) = self
                    .abi
                    .try_acquire_chunk_for_reading(ctm.page() as usize, ctm.chunk() as usize)
                else {
                    state.missing_chunks += 1;
                    return;
                };
                let stored = StoredChunk {
                    target_buffer: ctm.target_buffer(),
                    writer_id: chunk.writer_id(),
                    chunk_id: chunk.chunk_id(),
                    packets: chunk.packets(),
                    payload: chunk.payload().to_vec(),
                };
                self.abi.release_chunk_as_free(chunk);
                stored
            }
        };

        if stored.target_buffer == 0 {
            state.discarded_chunks += 1;
            return;
        }
        state.chunks.insert((stored.writer_id, stored.chunk_id), stored);
    }

    fn apply_patches(state: &mut ServiceState, ctp: &ChunkToPatch) {
        let key = (ctp.writer_id() as WriterId, ctp.chunk_id());
        let Some(chunk) = state.chunks.get_mut(&key) else {
            return;
        };
        for patch in &ctp.patches {
            let offset = patch.offset() as usize;
            let data = patch.data();
            if offset + data.len() <= chunk.payload.len() {
                chunk.payload[offset..offset + data.len()].copy_from_slice(data);
            }
        }
        if !ctp.has_more_patches() {
            chunk.packets.flags &= !Packets::CHUNK_NEEDS_PATCHING;
        }
    }
}

impl ProducerEndpoint for FakeProducerEndpoint {
    fn commit_data(&self, request: CommitDataRequest, callback: Option<FlushCallback>) {
        {
            let mut state = self.state.lock();
            state.commits.push(request.clone());
            if state.paused {
                state.backlog.push(request);
            } else {
                self.consume(&mut state, &request);
            }
            if callback.is_some() {
                state.callbacks_run += 1;
            }
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    fn register_trace_writer(&self, writer_id: WriterId, target_buffer: BufferId) {
        self.state.lock().registered.push((writer_id, target_buffer));
    }

    fn unregister_trace_writer(&self, writer_id: WriterId) {
        self.state.lock().unregistered.push(writer_id);
    }
}

/// Chunk copied into the request by shared memory emulation: header then payload.
fn parse_chunk_copy(data: &[u8], target_buffer: u32) -> Option<StoredChunk> {
    if data.len() < CHUNK_HEADER_SIZE {
        return None;
    }
    let chunk_id = u32::from_ne_bytes(data[0..4].try_into().ok()?);
    let writer_id = u16::from_ne_bytes(data[4..6].try_into().ok()?);
    let packets = Packets::from_raw(u16::from_ne_bytes(data[6..8].try_into().ok()?));
    Some(StoredChunk {
        target_buffer,
        writer_id,
        chunk_id,
        packets,
        payload: data[CHUNK_HEADER_SIZE..].to_vec(),
    })
}

fn reassemble<'a>(chunks: impl Iterator<Item = &'a StoredChunk>) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut partial: Option<Vec<u8>> = None;
    let mut prev_chunk_id: Option<ChunkId> = None;

    for chunk in chunks {
        if prev_chunk_id.map_or(true, |prev| prev.wrapping_add(1) != chunk.chunk_id) {
            // Gap in the sequence, a continuation cannot be trusted.
            partial = None;
        }
        prev_chunk_id = Some(chunk.chunk_id);

        let count = chunk.packets.count as usize;
        let flags = chunk.packets.flags;
        let mut offset = 0usize;
        for i in 0..count {
            let Some((size, used)) = parse_varint(&chunk.payload[offset..]) else {
                partial = None;
                break;
            };
            offset += used;
            if size == PACKET_SIZE_DROP_PACKET as u64 || offset + size as usize > chunk.payload.len() {
                partial = None;
                break;
            }
            let fragment = &chunk.payload[offset..offset + size as usize];
            offset += size as usize;

            let continues_from_prev = i == 0 && flags & Packets::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK != 0;
            let continues_on_next = i + 1 == count && flags & Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK != 0;

            let mut packet = if continues_from_prev {
                match partial.take() {
                    Some(mut head) => {
                        head.extend_from_slice(fragment);
                        head
                    }
                    // Head was lost, drop the tail as well.
                    None => continue,
                }
            } else {
                partial = None;
                fragment.to_vec()
            };

            if continues_on_next {
                partial = Some(std::mem::take(&mut packet));
            } else if !packet.is_empty() {
                packets.push(packet);
            }
        }
    }
    packets
}
