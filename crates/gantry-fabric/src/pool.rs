//! Fixed-capacity request pools.
//!
//! Each rail carries two pools: a control pool whose requests pair
//! one-to-one with 2 KiB slices of a single pre-registered buffer
//! chunk, and a buffer-less data pool for one-sided operations.
//! Acquire pops a free slot index in O(1); release pushes it back.
//! Completion events map back to their request through the context
//! token posted with the operation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use gantry_api::{BackendError, Result};

/// Control requests per rail, each owning one buffer slot.
pub const CONTROL_REQUESTS_PER_RAIL: usize = 256;
/// Data requests per rail.
pub const DATA_REQUESTS_PER_RAIL: usize = 1024;
/// Size of one control buffer slot.
pub const CONTROL_BUFFER_SIZE: usize = 2048;

/// Process-wide monotonic transfer-id allocator. Wraps on overflow;
/// uniqueness is only required across in-flight requests.
static NEXT_XFER_ID: AtomicU32 = AtomicU32::new(1);

fn next_xfer_id() -> u32 {
    NEXT_XFER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Operation a request is posted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// One-sided write.
    Write,
    /// One-sided read.
    Read,
    /// Two-sided control send.
    Send,
    /// Posted control receive.
    Recv,
}

/// Completion callback invoked exactly once per data request; the
/// argument is false when the operation completed in error.
pub type CompletionFn = Arc<dyn Fn(bool) + Send + Sync>;

/// One pooled request.
pub struct Request {
    /// Owning rail.
    pub rail_id: usize,
    /// Pre-assigned transfer id.
    pub xfer_id: u32,
    /// Operation kind set at allocation.
    pub op: OpKind,
    /// Offset of this request's slot in the control buffer chunk
    /// (control pools only).
    pub buffer_offset: usize,
    /// Bytes of the control buffer currently in use.
    pub buffer_len: usize,
    /// Chunk offset within the logical transfer (data requests).
    pub chunk_offset: usize,
    /// Chunk size (data requests).
    pub chunk_size: usize,
    /// Local source/target address.
    pub local_addr: u64,
    /// Remote address the operation targets.
    pub remote_addr: u64,
    /// Remote access key.
    pub remote_key: u64,
    /// Receiver-side index of the peer, for error attribution.
    pub peer_agent_idx: u16,
    /// Per-request completion callback.
    pub completion: Option<CompletionFn>,
}

impl Request {
    fn fresh(rail_id: usize) -> Self {
        Request {
            rail_id,
            xfer_id: next_xfer_id(),
            op: OpKind::Send,
            buffer_offset: 0,
            buffer_len: 0,
            chunk_offset: 0,
            chunk_size: 0,
            local_addr: 0,
            remote_addr: 0,
            remote_key: 0,
            peer_agent_idx: 0,
            completion: None,
        }
    }

    fn reset(&mut self) {
        self.op = OpKind::Send;
        self.buffer_len = 0;
        self.chunk_offset = 0;
        self.chunk_size = 0;
        self.local_addr = 0;
        self.remote_addr = 0;
        self.remote_key = 0;
        self.peer_agent_idx = 0;
        self.completion = None;
    }
}

const CONTROL_CONTEXT_BIT: u64 = 1 << 32;

/// Context token for a control-pool slot.
pub fn control_context(slot: usize) -> u64 {
    CONTROL_CONTEXT_BIT | slot as u64
}

/// Context token for a data-pool slot.
pub fn data_context(slot: usize) -> u64 {
    slot as u64
}

/// Split a context token back into (is_control, slot).
pub fn split_context(context: u64) -> (bool, usize) {
    (context & CONTROL_CONTEXT_BIT != 0, (context & 0xFFFF_FFFF) as usize)
}

struct PoolCore {
    requests: Vec<Mutex<Request>>,
    free: Mutex<Vec<usize>>,
    rail_id: usize,
}

impl PoolCore {
    fn new(capacity: usize, rail_id: usize) -> Self {
        let requests = (0..capacity).map(|_| Mutex::new(Request::fresh(rail_id))).collect();
        // LIFO free list: hot slots get reused first.
        let free = (0..capacity).rev().collect();
        PoolCore { requests, free: Mutex::new(free), rail_id }
    }

    fn acquire(&self) -> Option<usize> {
        self.free.lock().unwrap().pop()
    }

    fn release(&self, slot: usize) {
        if slot >= self.requests.len() {
            error!(slot, rail = self.rail_id, "release of out-of-range slot ignored");
            return;
        }
        self.requests[slot].lock().unwrap().reset();
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free.contains(&slot), "double release of slot {slot}");
        free.push(slot);
    }

    fn active_count(&self) -> usize {
        self.requests.len() - self.free.lock().unwrap().len()
    }

    fn with<R>(&self, slot: usize, f: impl FnOnce(&mut Request) -> R) -> R {
        f(&mut self.requests[slot].lock().unwrap())
    }
}

/// Pinned backing allocation for a control pool. The fabric reads and
/// writes slots through raw addresses while receives are outstanding,
/// so the chunk lives outside Rust's reference rules entirely.
struct Chunk {
    ptr: *mut u8,
    len: usize,
    layout: std::alloc::Layout,
}

// Slot disjointness is enforced by the free-index stack; concurrent
// access never aliases a slot.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len, 64).expect("chunk layout");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "control chunk allocation failed");
        Chunk { ptr, len, layout }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

/// Control pool: requests paired with slices of one buffer chunk.
///
/// The chunk is allocated once, registered once by the owning rail, and
/// never moves.
pub struct ControlPool {
    core: PoolCore,
    chunk: Chunk,
}

impl ControlPool {
    /// Build the pool and its backing chunk.
    pub fn new(rail_id: usize) -> Self {
        let core = PoolCore::new(CONTROL_REQUESTS_PER_RAIL, rail_id);
        let chunk = Chunk::new(CONTROL_REQUESTS_PER_RAIL * CONTROL_BUFFER_SIZE);
        for (slot, req) in core.requests.iter().enumerate() {
            req.lock().unwrap().buffer_offset = slot * CONTROL_BUFFER_SIZE;
        }
        ControlPool { core, chunk }
    }

    /// Address and length of the backing chunk, for registration.
    pub fn chunk(&self) -> (u64, usize) {
        (self.chunk.ptr as u64, self.chunk.len)
    }

    /// Allocate a control request able to hold `needed_size` payload
    /// bytes (plus the tag byte the poster prepends).
    pub fn allocate(&self, needed_size: usize) -> Result<usize> {
        if needed_size + 1 > CONTROL_BUFFER_SIZE {
            return Err(BackendError::backend(format!(
                "control payload of {needed_size} bytes exceeds {CONTROL_BUFFER_SIZE} byte slot"
            )));
        }
        self.core
            .acquire()
            .ok_or_else(|| BackendError::backend("control request pool exhausted"))
    }

    /// Write `payload` into the slot, reserving byte 0 for the tag.
    pub fn write_payload(&self, slot: usize, payload: &[u8]) {
        debug_assert!(payload.len() + 1 <= CONTROL_BUFFER_SIZE);
        unsafe {
            let base = self.chunk.ptr.add(slot * CONTROL_BUFFER_SIZE);
            std::ptr::copy(payload.as_ptr(), base.add(1), payload.len());
        }
        self.core.with(slot, |req| req.buffer_len = payload.len() + 1);
    }

    /// Stamp the tag byte of a populated slot.
    pub fn set_tag(&self, slot: usize, tag: u8) {
        unsafe {
            *self.chunk.ptr.add(slot * CONTROL_BUFFER_SIZE) = tag;
        }
    }

    /// The populated wire bytes of a slot (tag byte included). Valid
    /// while the slot is held.
    pub fn payload(&self, slot: usize) -> &[u8] {
        let len = self.core.with(slot, |req| req.buffer_len);
        unsafe { std::slice::from_raw_parts(self.chunk.ptr.add(slot * CONTROL_BUFFER_SIZE), len) }
    }

    /// The full slot as received bytes, for decoding an incoming
    /// payload of `len` bytes.
    pub fn received(&self, slot: usize, len: usize) -> &[u8] {
        let len = len.min(CONTROL_BUFFER_SIZE);
        unsafe { std::slice::from_raw_parts(self.chunk.ptr.add(slot * CONTROL_BUFFER_SIZE), len) }
    }

    /// Raw slot address, for posting receives.
    pub fn buffer_addr(&self, slot: usize) -> u64 {
        self.chunk.ptr as u64 + (slot * CONTROL_BUFFER_SIZE) as u64
    }

    /// Release a slot back to the pool.
    pub fn release(&self, slot: usize) {
        self.core.release(slot);
    }

    /// Requests currently in flight.
    pub fn active_count(&self) -> usize {
        self.core.active_count()
    }

    /// Run `f` on the slot's request under its lock.
    pub fn with<R>(&self, slot: usize, f: impl FnOnce(&mut Request) -> R) -> R {
        self.core.with(slot, f)
    }
}

/// Data pool: buffer-less requests for one-sided operations.
pub struct DataPool {
    core: PoolCore,
}

impl DataPool {
    /// Build the pool.
    pub fn new(rail_id: usize) -> Self {
        DataPool { core: PoolCore::new(DATA_REQUESTS_PER_RAIL, rail_id) }
    }

    /// Allocate a data request for the given operation.
    pub fn allocate(&self, op: OpKind) -> Result<usize> {
        let slot = self
            .core
            .acquire()
            .ok_or_else(|| BackendError::backend("data request pool exhausted"))?;
        self.core.with(slot, |req| req.op = op);
        Ok(slot)
    }

    /// Release a slot back to the pool. Never touches registrations.
    pub fn release(&self, slot: usize) {
        self.core.release(slot);
    }

    /// Requests currently in flight.
    pub fn active_count(&self) -> usize {
        self.core.active_count()
    }

    /// Run `f` on the slot's request under its lock.
    pub fn with<R>(&self, slot: usize, f: impl FnOnce(&mut Request) -> R) -> R {
        self.core.with(slot, f)
    }

    /// Take the slot's completion callback, leaving `None`.
    pub fn take_completion(&self, slot: usize) -> Option<CompletionFn> {
        self.core.with(slot, |req| req.completion.take())
    }
}
