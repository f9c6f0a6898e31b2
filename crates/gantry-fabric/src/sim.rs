//! In-process reliable-datagram fabric provider.
//!
//! Models the fabric objects the rail layer is written against: NIC
//! devices, endpoints with completion queues and address vectors, and a
//! per-device registered-memory table. All agents of one process attach
//! to one [`FabricDomain`]; delivery is reliable and executed at post
//! time, so the provider never drops or reorders a posted operation.
//!
//! One-sided operations move bytes with raw-pointer copies that are
//! bounds- and key-checked against the target registration before any
//! byte moves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on a serialized endpoint name.
pub const MAX_EP_NAME_LEN: usize = 56;

/// Completion events drained per progress batch.
pub const CQ_BATCH_SIZE: usize = 16;

static NEXT_EP_SEQ: AtomicU64 = AtomicU64::new(1);
static NEXT_MR_KEY: AtomicU64 = AtomicU64::new(1);

/// Result alias for provider operations.
pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// Provider-level failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FabricError {
    /// The named NIC does not exist in the domain.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The named endpoint does not exist in the domain.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The fabric address was never inserted or has been removed.
    #[error("invalid fabric address: {0}")]
    InvalidAddress(u64),

    /// No registration covers the addressed range under the given key.
    #[error("memory not registered for key {key:#x}")]
    NotRegistered {
        /// The remote key the initiator presented.
        key: u64,
    },

    /// The registration forbids the requested access.
    #[error("access denied for key {key:#x}")]
    AccessDenied {
        /// The remote key the initiator presented.
        key: u64,
    },

    /// Endpoint name exceeds [`MAX_EP_NAME_LEN`].
    #[error("endpoint name too long: {0} bytes")]
    NameTooLong(usize),

    /// The target endpoint was closed.
    #[error("endpoint closed")]
    Closed,
}

/// Access rights attached to a memory registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    /// Local read access.
    pub const LOCAL_READ: Self = Self(1);
    /// Local write access.
    pub const LOCAL_WRITE: Self = Self(2);
    /// Remote read access.
    pub const REMOTE_READ: Self = Self(4);
    /// Remote write access.
    pub const REMOTE_WRITE: Self = Self(8);
    /// All access rights.
    pub const ALL: Self = Self(0xF);

    /// True when every right in `other` is present.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// PCIe-ish placement of a NIC, used by topology discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NicLocation {
    /// NUMA node the NIC hangs off.
    pub numa_node: u32,
    /// Nearest GPU, when the NIC shares a PCIe switch with one.
    pub gpu: Option<u32>,
}

/// Dense handle for an inserted peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

/// Handle for a memory registration; also carries the remote key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    /// Key peers present to access this registration.
    pub key: u64,
}

/// Kind of a drained completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// A locally posted send finished.
    SendDone,
    /// A locally posted write finished.
    WriteDone,
    /// A locally posted read finished.
    ReadDone,
    /// A posted recv matched an incoming send.
    RecvData,
    /// A remote write with immediate data landed in local memory.
    RemoteWrite,
}

/// Failure recorded on an errored completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionError {
    /// The peer endpoint was closed.
    RemoteDisconnect,
    /// Registration lookup or access check failed at the target.
    Access,
}

/// One drained completion-queue entry.
#[derive(Debug, Clone, Copy)]
pub struct CompletionEvent {
    /// What completed.
    pub kind: CompletionKind,
    /// The context token supplied at post time (zero for remote
    /// events, which have no local request).
    pub context: u64,
    /// Immediate data carried by the operation.
    pub immediate: u32,
    /// Bytes moved or received.
    pub len: usize,
    /// Present when the operation completed in error.
    pub error: Option<CompletionError>,
}

/// Mutex+condvar completion queue with optional arrival signalling.
#[derive(Debug, Default)]
pub struct CompletionQueue {
    entries: Mutex<VecDeque<CompletionEvent>>,
    available: Condvar,
    arrival_flag: Mutex<Option<Arc<AtomicBool>>>,
}

impl CompletionQueue {
    fn push(&self, event: CompletionEvent) {
        self.entries.lock().unwrap().push_back(event);
        if let Some(flag) = self.arrival_flag.lock().unwrap().as_ref() {
            flag.store(true, Ordering::Release);
        }
        self.available.notify_all();
    }

    /// Register a flag set whenever an event arrives. Rails use this to
    /// mark themselves active so a pure receiver still gets swept.
    pub fn set_arrival_flag(&self, flag: Arc<AtomicBool>) {
        *self.arrival_flag.lock().unwrap() = Some(flag);
    }

    /// Drain up to `max` events without blocking.
    pub fn drain(&self, max: usize) -> Vec<CompletionEvent> {
        let mut entries = self.entries.lock().unwrap();
        let n = entries.len().min(max);
        entries.drain(..n).collect()
    }

    /// Block up to `timeout` for one event.
    pub fn read_blocking(&self, timeout: Duration) -> Option<CompletionEvent> {
        let mut entries = self.entries.lock().unwrap();
        if entries.is_empty() {
            let (guard, _) = self.available.wait_timeout(entries, timeout).unwrap();
            entries = guard;
        }
        entries.pop_front()
    }

    /// Number of undrained events.
    pub fn depth(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

struct PostedRecv {
    buf_addr: u64,
    buf_len: usize,
    context: u64,
}

struct UnmatchedSend {
    payload: Vec<u8>,
    immediate: u32,
}

struct Registration {
    addr: u64,
    len: usize,
    access: AccessFlags,
}

struct EndpointState {
    device: String,
    cq: Arc<CompletionQueue>,
    av: Mutex<Vec<Option<String>>>,
    recv_queue: Mutex<VecDeque<PostedRecv>>,
    unmatched: Mutex<VecDeque<UnmatchedSend>>,
    closed: AtomicBool,
}

struct DomainState {
    devices: HashMap<String, Option<NicLocation>>,
    endpoints: HashMap<String, Arc<EndpointState>>,
    // remote key -> (device, registration)
    registrations: HashMap<u64, (String, Registration)>,
}

/// Shared fabric all agents of a process attach to.
pub struct FabricDomain {
    state: Mutex<DomainState>,
}

impl FabricDomain {
    /// Create an empty domain.
    pub fn new() -> Arc<Self> {
        Arc::new(FabricDomain {
            state: Mutex::new(DomainState {
                devices: HashMap::new(),
                endpoints: HashMap::new(),
                registrations: HashMap::new(),
            }),
        })
    }

    /// Add a NIC with placement information.
    pub fn add_nic(&self, name: &str, location: NicLocation) {
        self.state.lock().unwrap().devices.insert(name.to_string(), Some(location));
    }

    /// Add a NIC without placement information; topology discovery
    /// falls back to the uniform mapping when any NIC is unlocated.
    pub fn add_nic_unlocated(&self, name: &str) {
        self.state.lock().unwrap().devices.insert(name.to_string(), None);
    }

    /// Snapshot of all NICs and their locations, name-sorted.
    pub fn nics(&self) -> Vec<(String, Option<NicLocation>)> {
        let state = self.state.lock().unwrap();
        let mut nics: Vec<_> =
            state.devices.iter().map(|(name, loc)| (name.clone(), *loc)).collect();
        nics.sort_by(|a, b| a.0.cmp(&b.0));
        nics
    }

    /// Open an endpoint on the named NIC.
    pub fn open_endpoint(self: &Arc<Self>, device: &str) -> FabricResult<Endpoint> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(device) {
            return Err(FabricError::UnknownDevice(device.to_string()));
        }
        let name = format!("{device}#{}", NEXT_EP_SEQ.fetch_add(1, Ordering::Relaxed));
        if name.len() > MAX_EP_NAME_LEN {
            return Err(FabricError::NameTooLong(name.len()));
        }
        let ep = Arc::new(EndpointState {
            device: device.to_string(),
            cq: Arc::new(CompletionQueue::default()),
            av: Mutex::new(Vec::new()),
            recv_queue: Mutex::new(VecDeque::new()),
            unmatched: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        state.endpoints.insert(name.clone(), Arc::clone(&ep));
        debug!(endpoint = %name, device, "opened endpoint");
        Ok(Endpoint { domain: Arc::clone(self), name, state: ep })
    }

    /// Register memory on the named NIC.
    pub fn register_memory(
        &self,
        device: &str,
        addr: u64,
        len: usize,
        access: AccessFlags,
    ) -> FabricResult<MrHandle> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(device) {
            return Err(FabricError::UnknownDevice(device.to_string()));
        }
        let key = NEXT_MR_KEY.fetch_add(1, Ordering::Relaxed);
        state
            .registrations
            .insert(key, (device.to_string(), Registration { addr, len, access }));
        Ok(MrHandle { key })
    }

    /// Remove a registration. Unknown keys report `NotRegistered`.
    pub fn deregister_memory(&self, mr: MrHandle) -> FabricResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .registrations
            .remove(&mr.key)
            .map(|_| ())
            .ok_or(FabricError::NotRegistered { key: mr.key })
    }

    fn lookup_endpoint(&self, name: &str) -> FabricResult<Arc<EndpointState>> {
        let state = self.state.lock().unwrap();
        state
            .endpoints
            .get(name)
            .cloned()
            .ok_or_else(|| FabricError::UnknownEndpoint(name.to_string()))
    }

    /// Validate a remote access and return the checked target address.
    fn check_remote(
        &self,
        device: &str,
        key: u64,
        addr: u64,
        len: usize,
        needed: AccessFlags,
    ) -> FabricResult<u64> {
        let state = self.state.lock().unwrap();
        let (reg_device, reg) =
            state.registrations.get(&key).ok_or(FabricError::NotRegistered { key })?;
        if reg_device != device {
            return Err(FabricError::NotRegistered { key });
        }
        if !reg.access.contains(needed) {
            return Err(FabricError::AccessDenied { key });
        }
        let end = addr.checked_add(len as u64).ok_or(FabricError::AccessDenied { key })?;
        if addr < reg.addr || end > reg.addr + reg.len as u64 {
            return Err(FabricError::AccessDenied { key });
        }
        Ok(addr)
    }
}

/// One endpoint opened on a NIC: the rail's handle to the fabric.
pub struct Endpoint {
    domain: Arc<FabricDomain>,
    name: String,
    state: Arc<EndpointState>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("name", &self.name).finish()
    }
}

impl Endpoint {
    /// This endpoint's unique printable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The domain this endpoint belongs to.
    pub fn domain(&self) -> &Arc<FabricDomain> {
        &self.domain
    }

    /// The NIC this endpoint was opened on.
    pub fn device(&self) -> &str {
        self.state.device.as_str()
    }

    /// The endpoint's completion queue.
    pub fn cq(&self) -> &Arc<CompletionQueue> {
        &self.state.cq
    }

    /// Whether the provider supports blocking completion reads.
    /// Probed once by the rail; constant for this provider.
    pub fn blocking_cq_read_supported(&self) -> bool {
        true
    }

    /// Insert a peer endpoint name, returning its dense address.
    pub fn insert_address(&self, peer_ep_name: &str) -> FabricResult<FabricAddr> {
        if peer_ep_name.len() > MAX_EP_NAME_LEN {
            return Err(FabricError::NameTooLong(peer_ep_name.len()));
        }
        let mut av = self.state.av.lock().unwrap();
        av.push(Some(peer_ep_name.to_string()));
        Ok(FabricAddr(av.len() as u64 - 1))
    }

    /// Remove an inserted address. Idempotent.
    pub fn remove_address(&self, addr: FabricAddr) {
        let mut av = self.state.av.lock().unwrap();
        if let Some(slot) = av.get_mut(addr.0 as usize) {
            *slot = None;
        }
    }

    fn resolve(&self, addr: FabricAddr) -> FabricResult<Arc<EndpointState>> {
        let name = {
            let av = self.state.av.lock().unwrap();
            av.get(addr.0 as usize)
                .and_then(|slot| slot.clone())
                .ok_or(FabricError::InvalidAddress(addr.0))?
        };
        let target = self.domain.lookup_endpoint(&name)?;
        if target.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        Ok(target)
    }

    /// Post a two-sided send. The payload is copied at post time; the
    /// target sees it once a matching recv is posted. Reliable: an
    /// unmatched send is buffered, never dropped.
    pub fn post_send(
        &self,
        dest: FabricAddr,
        payload: &[u8],
        immediate: u32,
        context: u64,
    ) -> FabricResult<()> {
        let target = match self.resolve(dest) {
            Ok(t) => t,
            Err(FabricError::Closed) => {
                self.state.cq.push(CompletionEvent {
                    kind: CompletionKind::SendDone,
                    context,
                    immediate: 0,
                    len: 0,
                    error: Some(CompletionError::RemoteDisconnect),
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        deliver_send(&target, payload, immediate);
        self.state.cq.push(CompletionEvent {
            kind: CompletionKind::SendDone,
            context,
            immediate: 0,
            len: payload.len(),
            error: None,
        });
        Ok(())
    }

    /// Post a receive buffer. Matches a buffered unmatched send
    /// immediately if one is waiting.
    ///
    /// The buffer must stay valid until the matching `RecvData`
    /// completion is drained; the provider writes into it through the
    /// raw address.
    pub fn post_recv(&self, buf_addr: u64, buf_len: usize, context: u64) -> FabricResult<()> {
        let pending = {
            let mut unmatched = self.state.unmatched.lock().unwrap();
            unmatched.pop_front()
        };
        match pending {
            Some(send) => {
                complete_recv(&self.state, &send.payload, send.immediate, buf_addr, buf_len, context)
            }
            None => {
                self.state
                    .recv_queue
                    .lock()
                    .unwrap()
                    .push_back(PostedRecv { buf_addr, buf_len, context });
            }
        }
        Ok(())
    }

    /// Post a one-sided write, optionally carrying immediate data that
    /// surfaces as a `RemoteWrite` completion at the target.
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &self,
        dest: FabricAddr,
        local_addr: u64,
        len: usize,
        immediate: Option<u32>,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> FabricResult<()> {
        let outcome = self.resolve(dest).and_then(|target| {
            self.domain
                .check_remote(
                    &target.device,
                    remote_key,
                    remote_addr,
                    len,
                    AccessFlags::REMOTE_WRITE,
                )
                .map(|checked| (target, checked))
        });
        match outcome {
            Ok((target, checked_addr)) => {
                // Bounds were checked against the live registration above.
                unsafe {
                    std::ptr::copy(local_addr as *const u8, checked_addr as *mut u8, len);
                }
                self.state.cq.push(CompletionEvent {
                    kind: CompletionKind::WriteDone,
                    context,
                    immediate: 0,
                    len,
                    error: None,
                });
                if let Some(imm) = immediate {
                    target.cq.push(CompletionEvent {
                        kind: CompletionKind::RemoteWrite,
                        context: 0,
                        immediate: imm,
                        len,
                        error: None,
                    });
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "write failed, completing in error");
                self.state.cq.push(CompletionEvent {
                    kind: CompletionKind::WriteDone,
                    context,
                    immediate: 0,
                    len: 0,
                    error: Some(completion_error_for(&e)),
                });
                Ok(())
            }
        }
    }

    /// Post a one-sided read of the remote region into local memory.
    pub fn post_read(
        &self,
        dest: FabricAddr,
        local_addr: u64,
        len: usize,
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> FabricResult<()> {
        let outcome = self.resolve(dest).and_then(|target| {
            self.domain.check_remote(
                &target.device,
                remote_key,
                remote_addr,
                len,
                AccessFlags::REMOTE_READ,
            )
        });
        match outcome {
            Ok(checked_addr) => {
                unsafe {
                    std::ptr::copy(checked_addr as *const u8, local_addr as *mut u8, len);
                }
                self.state.cq.push(CompletionEvent {
                    kind: CompletionKind::ReadDone,
                    context,
                    immediate: 0,
                    len,
                    error: None,
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "read failed, completing in error");
                self.state.cq.push(CompletionEvent {
                    kind: CompletionKind::ReadDone,
                    context,
                    immediate: 0,
                    len: 0,
                    error: Some(completion_error_for(&e)),
                });
                Ok(())
            }
        }
    }

    /// Close the endpoint. Subsequent operations targeting it complete
    /// in error with a remote-disconnect kind.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
        self.domain.state.lock().unwrap().endpoints.remove(&self.name);
    }
}

fn completion_error_for(err: &FabricError) -> CompletionError {
    match err {
        FabricError::Closed | FabricError::UnknownEndpoint(_) => CompletionError::RemoteDisconnect,
        _ => CompletionError::Access,
    }
}

fn deliver_send(target: &EndpointState, payload: &[u8], immediate: u32) {
    let recv = target.recv_queue.lock().unwrap().pop_front();
    match recv {
        Some(recv) => {
            complete_recv(target, payload, immediate, recv.buf_addr, recv.buf_len, recv.context)
        }
        None => {
            target
                .unmatched
                .lock()
                .unwrap()
                .push_back(UnmatchedSend { payload: payload.to_vec(), immediate });
        }
    }
}

fn complete_recv(
    target: &EndpointState,
    payload: &[u8],
    immediate: u32,
    buf_addr: u64,
    buf_len: usize,
    context: u64,
) {
    let n = payload.len().min(buf_len);
    // The recv buffer is pinned by its pool until this completion is
    // drained.
    unsafe {
        std::ptr::copy(payload.as_ptr(), buf_addr as *mut u8, n);
    }
    target.cq.push(CompletionEvent {
        kind: CompletionKind::RecvData,
        context,
        immediate,
        len: n,
        error: None,
    });
}
