// Hands out chunks of the shared memory buffer to trace writers and turns the
// chunks they return into batched commit requests for the service.
//
// ### Binding:
// An arbiter can be created before the producer is connected. Writers created
// then target startup reservations; the arbiter becomes fully bound once it
// has an endpoint and every reservation is resolved to a buffer (or aborted).
// Until then completed chunks accumulate in the pending commit request.
//
// ### Locking:
// One mutex guards the producer-local state. Chunk state lives in shared
// memory and changes through the ABI's atomics only. The endpoint and the task
// runner are never called while the lock is held.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::Core::alloc::IdAllocator;
use crate::Core::Abi::chunk::Chunk;
use crate::Core::Abi::layout::{ChunkHeaderInit, ChunkState, PageLayout, Packets};
use crate::Core::Abi::{AbiStats, SharedMemoryAbi, ShmemMode};
use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::Proto::patch_list::{Patch, PatchList};
use crate::Proto::proto_utils::MESSAGE_LENGTH_FIELD_SIZE;

use super::basic_types::{
    is_reservation_target_buffer_id, make_target_buffer_id_for_reservation, BufferExhaustedPolicy,
    BufferId, FlushCallback, FlushRequestId, MaybeUnboundBufferId, WriterId, INVALID_BUFFER_ID,
    MAX_WRITER_ID,
};
use super::commit_data_request::commit_data_request::chunk_to_patch;
use super::commit_data_request::commit_data_request::{ChunkToPatch, ChunksToMove};
use super::commit_data_request::CommitDataRequest;
use super::config::{ArbiterConfig, StallConfig};
use super::endpoint::ProducerEndpoint;
use super::null_trace_writer::NullTraceWriter;
use super::task_runner::TaskRunner;
use super::trace_writer::{TraceWriter, TraceWriterImpl};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TargetBufferReservation {
    pub(crate) resolved: bool,
    pub(crate) target_buffer: BufferId,
}

pub(crate) struct ArbiterState {
    pub(crate) producer_endpoint: Option<Arc<dyn ProducerEndpoint>>,
    pub(crate) task_runner: Option<Arc<dyn TaskRunner>>,

    pub(crate) active_writer_ids: IdAllocator<WriterId>,
    /// Writers created for unresolved reservations, registered at binding.
    pub(crate) pending_writers: HashMap<WriterId, MaybeUnboundBufferId>,
    pub(crate) target_buffer_reservations: HashMap<MaybeUnboundBufferId, TargetBufferReservation>,

    pub(crate) commit_data_req: Option<CommitDataRequest>,
    pub(crate) bytes_pending_commit: usize,
    pub(crate) delayed_flush_scheduled: bool,
    pub(crate) batch_commits_duration_ms: u32,
    /// Flush callbacks received while not fully bound.
    pub(crate) pending_flush_callbacks: Vec<FlushCallback>,

    pub(crate) fully_bound: bool,
    /// Sticky false once the arbiter was unbound with startup writers around.
    pub(crate) was_always_bound: bool,
    pub(crate) all_writers_have_drop_policy: bool,

    pub(crate) direct_patching_supported_by_service: bool,
    pub(crate) direct_patching_enabled: bool,
    pub(crate) did_shutdown: bool,

    /// Page where the next chunk scan starts.
    pub(crate) page_idx: usize,
}

/// Counts of chunk and page states, see `SharedMemoryArbiter::get_stats`.
pub type ArbiterStats = AbiStats;

pub struct SharedMemoryArbiter {
    shmem: Arc<dyn SharedMemoryBackend>,
    abi: SharedMemoryAbi,
    page_layout: PageLayout,
    stall: StallConfig,
    state: Mutex<ArbiterState>,
    weak_self: Weak<SharedMemoryArbiter>,
}

impl SharedMemoryArbiter {
    /// Creates an arbiter bound to `endpoint`, which commits on `task_runner`.
    pub fn create_instance(
        shmem: Arc<dyn SharedMemoryBackend>,
        page_size: usize,
        shmem_mode: ShmemMode,
        endpoint: Arc<dyn ProducerEndpoint>,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Result<Arc<Self>> {
        let config = ArbiterConfig {
            page_size,
            shmem_mode,
            ..ArbiterConfig::default()
        };
        Self::with_config(shmem, &config, Some((endpoint, task_runner)))
    }

    /// Creates an arbiter that has no endpoint yet. Only startup writers (or
    /// writers with the Drop policy) can be created until
    /// `bind_to_producer_endpoint()`.
    pub fn create_unbound_instance(
        shmem: Arc<dyn SharedMemoryBackend>,
        page_size: usize,
        shmem_mode: ShmemMode,
    ) -> Result<Arc<Self>> {
        let config = ArbiterConfig {
            page_size,
            shmem_mode,
            ..ArbiterConfig::default()
        };
        Self::with_config(shmem, &config, None)
    }

    pub fn with_config(
        shmem: Arc<dyn SharedMemoryBackend>,
        config: &ArbiterConfig,
        binding: Option<(Arc<dyn ProducerEndpoint>, Arc<dyn TaskRunner>)>,
    ) -> Result<Arc<Self>> {
        if config.page_layout.num_chunks() == 0 {
            return Err(Error::Unsupported("page layout must split pages into chunks"));
        }
        let abi = unsafe { SharedMemoryAbi::new(shmem.as_ptr(), shmem.size(), config.page_size, config.shmem_mode)? };
        let fully_bound = binding.is_some();
        let (producer_endpoint, task_runner) = match binding {
            Some((endpoint, runner)) => (Some(endpoint), Some(runner)),
            None => (None, None),
        };
        tracing::debug!(
            size = abi.size(),
            page_size = abi.page_size(),
            num_pages = abi.num_pages(),
            bound = fully_bound,
            "creating shared memory arbiter"
        );

        Ok(Arc::new_cyclic(|weak_self| Self {
            shmem,
            abi,
            page_layout: config.page_layout,
            stall: config.stall,
            state: Mutex::new(ArbiterState {
                producer_endpoint,
                task_runner,
                active_writer_ids: IdAllocator::new(MAX_WRITER_ID),
                pending_writers: HashMap::new(),
                target_buffer_reservations: HashMap::new(),
                commit_data_req: None,
                bytes_pending_commit: 0,
                delayed_flush_scheduled: false,
                batch_commits_duration_ms: config.batch_commits_duration_ms,
                pending_flush_callbacks: Vec::new(),
                fully_bound,
                was_always_bound: true,
                all_writers_have_drop_policy: true,
                direct_patching_supported_by_service: false,
                direct_patching_enabled: false,
                did_shutdown: false,
                page_idx: 0,
            }),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn abi(&self) -> &SharedMemoryAbi {
        &self.abi
    }

    pub fn shared_memory(&self) -> &Arc<dyn SharedMemoryBackend> {
        &self.shmem
    }

    pub fn page_layout(&self) -> PageLayout {
        self.page_layout
    }

    pub fn stall_config(&self) -> StallConfig {
        self.stall
    }

    pub fn is_fully_bound(&self) -> bool {
        self.state.lock().fully_bound
    }

    pub fn was_always_bound(&self) -> bool {
        self.state.lock().was_always_bound
    }

    pub fn bytes_pending_commit(&self) -> usize {
        self.state.lock().bytes_pending_commit
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock()
    }

    /// Finds a free chunk and stamps `header` into it. Returns None when the
    /// buffer is exhausted and `policy` says to drop.
    pub fn get_new_chunk(&self, header: &ChunkHeaderInit, policy: BufferExhaustedPolicy) -> Option<Chunk> {
        let (should_stall, should_abort) = match policy {
            BufferExhaustedPolicy::Drop => (false, false),
            BufferExhaustedPolicy::Stall => (true, true),
            BufferExhaustedPolicy::StallThenDrop => (true, false),
        };
        let num_chunks = self.page_layout.num_chunks();
        let mut stall_count: u32 = 0;
        let mut stall_interval_us: u64 = 0;

        loop {
            let runs_on_current_thread;
            {
                let mut state = self.state.lock();
                debug_assert!(state.was_always_bound || !should_stall);
                runs_on_current_thread = state
                    .task_runner
                    .as_ref()
                    .map_or(false, |runner| runner.runs_tasks_on_current_thread());

                // Nobody else would commit while this thread holds the task
                // runner, so commit here once half the buffer is pending.
                let should_commit_synchronously = runs_on_current_thread
                    && should_stall
                    && state.commit_data_req.is_some()
                    && state.bytes_pending_commit >= self.abi.size() / 2;

                let num_pages = self.abi.num_pages();
                let initial_page_idx = state.page_idx;
                for i in 0..num_pages {
                    let page_idx = (initial_page_idx + i) % num_pages;
                    state.page_idx = page_idx;

                    let mut is_new_page = false;
                    if self.abi.is_page_free(page_idx) {
                        is_new_page = self.abi.try_partition_page(page_idx, self.page_layout);
                    }
                    let mut free_chunks = if is_new_page {
                        (1u32 << num_chunks) - 1
                    } else {
                        self.abi.get_free_chunks(page_idx)
                    };

                    let mut chunk_idx = 0usize;
                    while free_chunks != 0 {
                        if free_chunks & 1 != 0 {
                            if let Some(chunk) = self.abi.try_acquire_chunk_for_writing(page_idx, chunk_idx, header) {
                                if stall_count > self.stall.log_after_n_stalls {
                                    tracing::info!(
                                        writer_id = header.writer_id,
                                        stall_count,
                                        "recovered from stall on shared memory buffer"
                                    );
                                }
                                if should_commit_synchronously {
                                    drop(state);
                                    self.flush_pending_commit_data_requests(None);
                                }
                                return Some(chunk);
                            }
                        }
                        chunk_idx += 1;
                        free_chunks >>= 1;
                    }
                }
            }

            if !should_stall {
                tracing::debug!(
                    writer_id = header.writer_id,
                    "shared memory buffer exhausted, returning invalid chunk"
                );
                return None;
            }

            // Stalling is only safe if no startup writer ever depended on a
            // binding that might never happen.
            assert!(
                self.state.lock().was_always_bound,
                "stalling on a shared memory buffer that was not always bound"
            );

            if stall_count == self.stall.log_after_n_stalls {
                tracing::info!(
                    writer_id = header.writer_id,
                    "shared memory buffer overrun, stalling"
                );
            }
            stall_count += 1;

            if stall_count == self.stall.assert_at_n_stalls {
                let stats = self.get_stats();
                if should_abort {
                    tracing::error!(?stats, stall_count, "shared memory buffer max stall count exceeded");
                    panic!(
                        "shared memory buffer max stall count exceeded, the service is not draining \
                         the buffer (stats: {:?})",
                        stats
                    );
                }
                tracing::warn!(?stats, "shared memory buffer max stall count exceeded, dropping");
                return None;
            }

            if self.stall.flush_commits_after_every_n_stalls > 0
                && stall_count % self.stall.flush_commits_after_every_n_stalls == 0
                && runs_on_current_thread
            {
                // Stalling on the task runner thread: no posted flush can run,
                // so commit from here to let the service free chunks.
                self.flush_pending_commit_data_requests(None);
            } else {
                thread::sleep(Duration::from_micros(stall_interval_us));
                stall_interval_us = self
                    .stall
                    .max_stall_interval_us
                    .min((stall_interval_us + 1) * 8);
            }
        }
    }

    /// Takes back a filled chunk, queues it for commit together with any
    /// ready patches from `patch_list`.
    pub fn return_completed_chunk(
        &self,
        chunk: Chunk,
        writer_id: WriterId,
        target_buffer: MaybeUnboundBufferId,
        patch_list: &mut PatchList,
    ) {
        self.update_commit_data_request(Some(chunk), writer_id, target_buffer, patch_list);
    }

    /// Queues the ready patches from `patch_list` without returning a chunk.
    pub fn send_patches(&self, writer_id: WriterId, target_buffer: MaybeUnboundBufferId, patch_list: &mut PatchList) {
        self.update_commit_data_request(None, writer_id, target_buffer, patch_list);
    }

    fn update_commit_data_request(
        &self,
        chunk: Option<Chunk>,
        writer_id: WriterId,
        target_buffer: MaybeUnboundBufferId,
        patch_list: &mut PatchList,
    ) {
        let mut post: Option<(Arc<dyn TaskRunner>, u32)> = None;
        let mut flush_synchronously = false;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.commit_data_req.is_none() {
                state.commit_data_req = Some(CommitDataRequest::default());
                // Batch: commit after the configured delay unless something
                // forces an earlier flush.
                if state.fully_bound && !state.delayed_flush_scheduled {
                    if let Some(runner) = state.task_runner.clone() {
                        post = Some((runner, state.batch_commits_duration_ms));
                        state.delayed_flush_scheduled = true;
                    }
                }
            }
            let direct_patching = state.direct_patching_enabled;
            let req = match state.commit_data_req.as_mut() {
                Some(req) => req,
                None => return,
            };

            if let Some(chunk) = chunk {
                debug_assert_eq!(chunk.writer_id(), writer_id);
                let chunk_idx = chunk.chunk_idx();
                state.bytes_pending_commit += chunk.size();

                // A chunk that will be patched in place stays BeingWritten so
                // the service does not read it before the patches land.
                let page_idx = if direct_patching && chunk.packets().flags & Packets::CHUNK_NEEDS_PATCHING != 0 {
                    self.abi.get_page_and_chunk_index(&chunk).0
                } else {
                    self.abi.release_chunk_as_complete(chunk)
                };

                req.chunks_to_move.push(ChunksToMove {
                    page: Some(page_idx as u32),
                    chunk: Some(chunk_idx as u32),
                    target_buffer: Some(target_buffer),
                    data: None,
                });
            }

            let mut last_chunk_to_patch: Option<usize> = None;
            while patch_list.front_is_patched() {
                let Some(patch) = patch_list.pop_front() else {
                    break;
                };
                let more_patches_for_chunk = patch_list.front().map_or(false, |next| next.chunk_id == patch.chunk_id);

                if direct_patching
                    && self.try_direct_patch_locked(&req.chunks_to_move, writer_id, &patch, more_patches_for_chunk)
                {
                    continue;
                }

                let same_chunk = last_chunk_to_patch
                    .map_or(false, |idx| req.chunks_to_patch[idx].chunk_id == Some(patch.chunk_id));
                if !same_chunk {
                    req.chunks_to_patch.push(ChunkToPatch {
                        target_buffer: Some(target_buffer),
                        writer_id: Some(writer_id as u32),
                        chunk_id: Some(patch.chunk_id),
                        patches: Vec::new(),
                        has_more_patches: None,
                    });
                    last_chunk_to_patch = Some(req.chunks_to_patch.len() - 1);
                }
                if let Some(idx) = last_chunk_to_patch {
                    req.chunks_to_patch[idx].patches.push(chunk_to_patch::Patch {
                        offset: Some(patch.offset as u32),
                        data: Some(patch.size_field.to_vec()),
                    });
                }
            }

            // The chunk still has unfilled patches; tell the service not to
            // consider it final yet.
            if let Some(idx) = last_chunk_to_patch {
                let chunk_id = req.chunks_to_patch[idx].chunk_id;
                if patch_list.front().map_or(false, |next| Some(next.chunk_id) == chunk_id) {
                    req.chunks_to_patch[idx].has_more_patches = Some(true);
                }
            }

            if state.fully_bound
                && (last_chunk_to_patch.is_some() || state.bytes_pending_commit >= self.abi.size() / 2)
            {
                if let Some(runner) = state.task_runner.clone() {
                    post = Some((runner, 0));
                }
            }

            // Without real shared memory the chunk has to be copied out right
            // away, the writer may reuse it any time.
            if state.fully_bound && self.abi.shmem_mode() == ShmemMode::Emulation {
                if let Some(runner) = state.task_runner.clone() {
                    if runner.runs_tasks_on_current_thread() {
                        post = None;
                        state.delayed_flush_scheduled = false;
                        flush_synchronously = true;
                    } else {
                        post = Some((runner, 0));
                    }
                }
            }
        }

        if flush_synchronously {
            self.flush_pending_commit_data_requests(None);
        }
        if let Some((runner, delay_ms)) = post {
            let weak = self.weak_self.clone();
            runner.post_delayed_task(
                Box::new(move || {
                    if let Some(arbiter) = weak.upgrade() {
                        arbiter.state.lock().delayed_flush_scheduled = false;
                        arbiter.flush_pending_commit_data_requests(None);
                    }
                }),
                delay_ms,
            );
        }
    }

    /// Applies `patch` in place if its chunk is in the pending batch and still
    /// BeingWritten. Releases the chunk as complete after its last patch.
    fn try_direct_patch_locked(
        &self,
        chunks_to_move: &[ChunksToMove],
        writer_id: WriterId,
        patch: &Patch,
        more_patches_for_chunk: bool,
    ) -> bool {
        // Most recent chunks are the likeliest targets.
        for ctm in chunks_to_move.iter().rev() {
            let page_idx = ctm.page() as usize;
            let chunk_idx = ctm.chunk() as usize;
            let bitmap = self.abi.get_page_header_bitmap(page_idx);
            if SharedMemoryAbi::chunk_state_from_header_bitmap(bitmap, chunk_idx) != ChunkState::BeingWritten {
                continue;
            }
            // BeingWritten chunks in the batch were returned by writers and
            // are only touched under the arbiter lock.
            let mut chunk = unsafe { self.abi.get_chunk_unchecked(page_idx, bitmap, chunk_idx) };
            if chunk.writer_id() != writer_id || chunk.chunk_id() != patch.chunk_id {
                continue;
            }

            let offset = patch.offset as usize;
            assert!(
                offset + MESSAGE_LENGTH_FIELD_SIZE <= chunk.payload_size(),
                "patch offset {} outside of chunk payload",
                offset
            );
            unsafe {
                let dst = chunk.payload_begin().add(offset);
                debug_assert!(std::slice::from_raw_parts(dst, MESSAGE_LENGTH_FIELD_SIZE).iter().all(|b| *b == 0));
                std::ptr::copy_nonoverlapping(patch.size_field.as_ptr(), dst, MESSAGE_LENGTH_FIELD_SIZE);
            }

            if !more_patches_for_chunk {
                chunk.clear_needs_patching_flag();
                self.abi.release_chunk_as_complete(chunk);
            }
            return true;
        }
        false
    }

    /// Sends the pending commit request, if any, to the endpoint. Runs on the
    /// task runner thread; called elsewhere it reposts itself there. While not
    /// fully bound the callback is kept until binding completes.
    pub fn flush_pending_commit_data_requests(&self, callback: Option<FlushCallback>) {
        let req;
        let endpoint;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if !state.fully_bound {
                if let Some(callback) = callback {
                    state.pending_flush_callbacks.push(callback);
                }
                return;
            }
            let Some(runner) = state.task_runner.clone() else {
                return;
            };
            if !runner.runs_tasks_on_current_thread() {
                drop(guard);
                let weak = self.weak_self.clone();
                runner.post_task(Box::new(move || {
                    if let Some(arbiter) = weak.upgrade() {
                        arbiter.flush_pending_commit_data_requests(callback);
                    }
                }));
                return;
            }

            req = match state.commit_data_req.take() {
                Some(mut req) => {
                    let all_placeholders_replaced =
                        Self::replace_commit_placeholder_buffer_ids_locked(&state.target_buffer_reservations, &mut req);
                    debug_assert!(all_placeholders_replaced);

                    for ctm in req.chunks_to_move.iter_mut() {
                        self.finish_chunk_for_commit(ctm);
                    }
                    state.bytes_pending_commit = 0;
                    Some(req)
                }
                None => None,
            };
            endpoint = state.producer_endpoint.clone();
        }

        let Some(endpoint) = endpoint else {
            return;
        };
        match req {
            Some(req) => endpoint.commit_data(req, callback),
            None => {
                // Nothing to commit, but the caller still waits for an ack.
                if callback.is_some() {
                    endpoint.commit_data(CommitDataRequest::default(), callback);
                }
            }
        }
    }

    /// Chunks left BeingWritten for direct patching are released now; in
    /// emulation mode the chunk is also copied into the request and freed.
    fn finish_chunk_for_commit(&self, ctm: &mut ChunksToMove) {
        let page_idx = ctm.page() as usize;
        let chunk_idx = ctm.chunk() as usize;
        let bitmap = self.abi.get_page_header_bitmap(page_idx);
        if SharedMemoryAbi::chunk_state_from_header_bitmap(bitmap, chunk_idx) == ChunkState::BeingWritten {
            let chunk = unsafe { self.abi.get_chunk_unchecked(page_idx, bitmap, chunk_idx) };
            self.abi.release_chunk_as_complete(chunk);
        }

        if self.abi.shmem_mode() == ShmemMode::Emulation {
            let bitmap = self.abi.get_page_header_bitmap(page_idx);
            let chunk = unsafe { self.abi.get_chunk_unchecked(page_idx, bitmap, chunk_idx) };
            ctm.data = Some(chunk.as_slice().to_vec());
            self.abi.release_chunk_as_free(chunk);
        }
    }

    /// Replaces reservation ids by resolved buffer ids. Returns false if some
    /// reservation is still unresolved.
    fn replace_commit_placeholder_buffer_ids_locked(
        reservations: &HashMap<MaybeUnboundBufferId, TargetBufferReservation>,
        req: &mut CommitDataRequest,
    ) -> bool {
        let mut all_replaced = true;
        let mut resolve = |target: &mut Option<u32>| {
            let Some(id) = *target else {
                return;
            };
            if !is_reservation_target_buffer_id(id) {
                return;
            }
            match reservations.get(&id) {
                Some(reservation) if reservation.resolved => {
                    *target = Some(reservation.target_buffer as u32);
                }
                _ => all_replaced = false,
            }
        };
        for ctm in req.chunks_to_move.iter_mut() {
            resolve(&mut ctm.target_buffer);
        }
        for ctp in req.chunks_to_patch.iter_mut() {
            resolve(&mut ctp.target_buffer);
        }
        all_replaced
    }

    /// Marks the arbiter as shutting down. Returns true once no writer is
    /// alive, i.e. the arbiter and its buffer can be destroyed.
    pub fn try_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        state.did_shutdown = true;
        state.active_writer_ids.is_empty()
    }

    /// Creates a writer for `target_buffer`. Never fails: when writer ids run
    /// out or the arbiter is shut down a `NullTraceWriter` is returned.
    pub fn create_trace_writer(
        self: &Arc<Self>,
        target_buffer: BufferId,
        policy: BufferExhaustedPolicy,
    ) -> Box<dyn TraceWriter> {
        assert!(target_buffer > 0, "target buffer 0 is invalid");
        self.create_trace_writer_internal(target_buffer as MaybeUnboundBufferId, policy)
    }

    /// Creates a writer for a startup reservation, usable before the service
    /// assigned a buffer. Startup writers always drop on exhaustion.
    pub fn create_startup_trace_writer(self: &Arc<Self>, target_buffer_reservation_id: u16) -> Box<dyn TraceWriter> {
        self.create_trace_writer_internal(
            make_target_buffer_id_for_reservation(target_buffer_reservation_id),
            BufferExhaustedPolicy::Drop,
        )
    }

    fn create_trace_writer_internal(
        self: &Arc<Self>,
        target_buffer: MaybeUnboundBufferId,
        policy: BufferExhaustedPolicy,
    ) -> Box<dyn TraceWriter> {
        let mut target_buffer = target_buffer;
        let id;
        let mut post: Option<(Arc<dyn TaskRunner>, BufferId)> = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.did_shutdown {
                return Box::new(NullTraceWriter::new());
            }

            id = state.active_writer_ids.allocate();
            if id == 0 {
                tracing::warn!("out of trace writer ids, returning a null writer");
                return Box::new(NullTraceWriter::new());
            }

            let uses_drop_policy = policy == BufferExhaustedPolicy::Drop;
            state.all_writers_have_drop_policy &= uses_drop_policy;

            if is_reservation_target_buffer_id(target_buffer) {
                let reservation = state
                    .target_buffer_reservations
                    .entry(target_buffer)
                    .or_default();
                if reservation.resolved {
                    target_buffer = reservation.target_buffer as MaybeUnboundBufferId;
                }
            }

            if is_reservation_target_buffer_id(target_buffer) {
                // Registered once the reservation is bound.
                state.pending_writers.insert(id, target_buffer);
                state.fully_bound = false;
                state.was_always_bound = false;
            } else if target_buffer != INVALID_BUFFER_ID as MaybeUnboundBufferId {
                match (&state.producer_endpoint, &state.task_runner) {
                    (Some(_), Some(runner)) => post = Some((runner.clone(), target_buffer as BufferId)),
                    _ => panic!("trace writer for a concrete buffer on an arbiter without endpoint"),
                }
            }

            // Writers that might wait for a free chunk require a bound arbiter.
            assert!(
                state.fully_bound || state.all_writers_have_drop_policy,
                "only drop-policy writers can be created on an unbound arbiter"
            );
            assert!(
                state.was_always_bound || uses_drop_policy,
                "stalling writers cannot be used after startup tracing"
            );
        }

        if let Some((runner, buffer_id)) = post {
            let weak = self.weak_self.clone();
            runner.post_task(Box::new(move || {
                if let Some(arbiter) = weak.upgrade() {
                    let endpoint = arbiter.state.lock().producer_endpoint.clone();
                    if let Some(endpoint) = endpoint {
                        endpoint.register_trace_writer(id, buffer_id);
                    }
                }
            }));
        }

        Box::new(TraceWriterImpl::new(self.clone(), id, target_buffer, policy))
    }

    /// Connects an unbound arbiter. Must run on `task_runner`.
    pub fn bind_to_producer_endpoint(&self, endpoint: Arc<dyn ProducerEndpoint>, task_runner: Arc<dyn TaskRunner>) {
        debug_assert!(task_runner.runs_tasks_on_current_thread());
        let should_flush;
        let mut callback = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            assert!(state.producer_endpoint.is_none(), "arbiter already bound to an endpoint");
            assert!(!state.fully_bound);

            state.producer_endpoint = Some(endpoint);
            state.task_runner = Some(task_runner);
            should_flush = Self::update_fully_bound_locked(state);
            if should_flush {
                callback = Self::take_pending_flush_callbacks_locked(state);
            }
            tracing::debug!(fully_bound = state.fully_bound, "arbiter bound to producer endpoint");
        }

        if should_flush {
            self.flush_pending_commit_data_requests(callback);
        }
    }

    /// Resolves startup reservation `reservation_id` to `buffer_id` and
    /// registers the writers waiting for it. Must run on the task runner.
    pub fn bind_startup_target_buffer(&self, reservation_id: u16, buffer_id: BufferId) {
        assert!(buffer_id > 0, "binding to buffer 0 is invalid");
        let guard = self.state.lock();
        assert!(
            guard.producer_endpoint.is_some() && guard.task_runner.is_some(),
            "bind_startup_target_buffer() before bind_to_producer_endpoint()"
        );
        debug_assert!(guard
            .task_runner
            .as_ref()
            .map_or(false, |runner| runner.runs_tasks_on_current_thread()));
        self.bind_startup_target_buffer_impl(guard, reservation_id, buffer_id);
    }

    /// Resolves `reservation_id` to "discard": its writers' data is dropped by
    /// the service and they are never registered.
    pub fn abort_startup_tracing_for_reservation(&self, reservation_id: u16) {
        let guard = self.state.lock();
        if let Some(runner) = guard.task_runner.clone() {
            if !runner.runs_tasks_on_current_thread() {
                drop(guard);
                let weak = self.weak_self.clone();
                runner.post_task(Box::new(move || {
                    if let Some(arbiter) = weak.upgrade() {
                        arbiter.abort_startup_tracing_for_reservation(reservation_id);
                    }
                }));
                return;
            }
        }
        self.bind_startup_target_buffer_impl(guard, reservation_id, INVALID_BUFFER_ID);
    }

    fn bind_startup_target_buffer_impl(
        &self,
        mut guard: MutexGuard<'_, ArbiterState>,
        reservation_id: u16,
        target_buffer_id: BufferId,
    ) {
        let reserved_id = make_target_buffer_id_for_reservation(reservation_id);
        let state = &mut *guard;

        let reservation = state.target_buffer_reservations.entry(reserved_id).or_default();
        assert!(!reservation.resolved, "startup reservation {} resolved twice", reservation_id);
        reservation.resolved = true;
        reservation.target_buffer = target_buffer_id;

        let mut writers_to_register = Vec::new();
        state.pending_writers.retain(|writer_id, target| {
            if *target != reserved_id {
                return true;
            }
            if target_buffer_id != INVALID_BUFFER_ID {
                writers_to_register.push(*writer_id);
            }
            false
        });

        let should_flush = Self::update_fully_bound_locked(state);
        let callback = if should_flush {
            Self::take_pending_flush_callbacks_locked(state)
        } else {
            None
        };
        let endpoint = state.producer_endpoint.clone();
        tracing::debug!(
            reservation_id,
            target_buffer_id,
            registered = writers_to_register.len(),
            fully_bound = state.fully_bound,
            "startup reservation bound"
        );
        drop(guard);

        if let Some(endpoint) = endpoint {
            for writer_id in writers_to_register {
                endpoint.register_trace_writer(writer_id, target_buffer_id);
            }
        }
        if should_flush {
            self.flush_pending_commit_data_requests(callback);
        }
    }

    /// Recomputes `fully_bound`; returns true if it just became true.
    fn update_fully_bound_locked(state: &mut ArbiterState) -> bool {
        if state.producer_endpoint.is_none() {
            debug_assert!(!state.fully_bound);
            return false;
        }
        let was_bound = state.fully_bound;
        state.fully_bound = state.target_buffer_reservations.values().all(|r| r.resolved);
        !was_bound && state.fully_bound
    }

    fn take_pending_flush_callbacks_locked(state: &mut ArbiterState) -> Option<FlushCallback> {
        if state.pending_flush_callbacks.is_empty() {
            return None;
        }
        let callbacks = std::mem::take(&mut state.pending_flush_callbacks);
        Some(Box::new(move || {
            for callback in callbacks {
                callback();
            }
        }))
    }

    /// Called when the service asks for a flush: the next commit carries
    /// `req_id` to acknowledge it.
    pub fn notify_flush_complete(&self, req_id: FlushRequestId) {
        let runner;
        {
            let mut state = self.state.lock();
            let req = state.commit_data_req.get_or_insert_with(CommitDataRequest::default);
            req.flush_request_id = Some(req.flush_request_id().max(req_id));
            runner = state.task_runner.clone();
        }
        if let Some(runner) = runner {
            let weak = self.weak_self.clone();
            runner.post_task(Box::new(move || {
                if let Some(arbiter) = weak.upgrade() {
                    arbiter.flush_pending_commit_data_requests(None);
                }
            }));
        }
    }

    /// Frees the writer's id and unregisters it from the service.
    pub fn release_writer_id(&self, id: WriterId) {
        let runner;
        {
            let mut state = self.state.lock();
            state.active_writer_ids.free(id);
            // Never registered.
            if state.pending_writers.remove(&id).is_some() {
                return;
            }
            runner = state.task_runner.clone();
        }
        let Some(runner) = runner else {
            return;
        };
        let weak = self.weak_self.clone();
        runner.post_task(Box::new(move || {
            if let Some(arbiter) = weak.upgrade() {
                let endpoint = arbiter.state.lock().producer_endpoint.clone();
                if let Some(endpoint) = endpoint {
                    endpoint.unregister_trace_writer(id);
                }
            }
        }));
    }

    pub fn set_batch_commits_duration(&self, batch_commits_duration_ms: u32) {
        self.state.lock().batch_commits_duration_ms = batch_commits_duration_ms;
    }

    pub fn set_direct_smb_patching_supported_by_service(&self) {
        self.state.lock().direct_patching_supported_by_service = true;
    }

    /// Turns on in-place patching. Only possible after the service declared
    /// support for it.
    pub fn enable_direct_smb_patching(&self) -> bool {
        let mut state = self.state.lock();
        if !state.direct_patching_supported_by_service {
            return false;
        }
        state.direct_patching_enabled = true;
        true
    }

    pub fn get_stats(&self) -> ArbiterStats {
        self.abi.get_stats()
    }
}
