//! A rail: one NIC's endpoint, completion queue, address vector, and
//! request pools.
//!
//! The rail owns completion classification: draining its queue in
//! batches, mapping each event back to the posted request, and
//! dispatching control traffic to the callbacks the engine registers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use gantry_api::{BackendError, Result};

use crate::pool::{
    control_context, data_context, split_context, ControlPool, DataPool, OpKind,
    CONTROL_BUFFER_SIZE,
};
use crate::sim::{
    AccessFlags, CompletionError, CompletionEvent, CompletionKind, Endpoint, FabricAddr,
    FabricDomain, FabricError, MrHandle, CQ_BATCH_SIZE,
};
use crate::wire::{ControlTag, unpack_data_immediate};

/// How long a blocking progress call waits before giving up the CPU.
const BLOCKING_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Receives pre-posted on every control rail at startup.
pub const INITIAL_RECVS_PER_CONTROL_RAIL: usize = 64;

/// Result of one progress sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// At least one completion was processed.
    DidWork,
    /// The completion queue was empty.
    Idle,
}

/// Invoked with the decoded payload of a received notification.
pub type NotificationCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
/// Invoked with `(agent_idx, payload)` of a connection acknowledgment.
pub type ConnectionAckCallback = Box<dyn Fn(u16, &[u8]) + Send + Sync>;
/// Invoked with `(agent_idx, payload)` of a connection request.
pub type ConnectionReqCallback = Box<dyn Fn(u16, &[u8]) -> Result<()> + Send + Sync>;
/// Invoked with `(agent_idx, payload)` of a disconnect request.
pub type DisconnectCallback = Box<dyn Fn(u16, &[u8]) + Send + Sync>;
/// Invoked with the low half of an arrived write's transfer id.
pub type XferIdCallback = Box<dyn Fn(u16) + Send + Sync>;
/// Invoked with `(agent_idx, error)` when a completion reports failure.
pub type RailErrorCallback = Box<dyn Fn(u16, CompletionError) + Send + Sync>;

/// One NIC bound into the engine.
pub struct Rail {
    /// This rail's id within its manager.
    pub rail_id: usize,
    /// The NIC this rail runs on.
    pub device: String,
    endpoint: Endpoint,
    control_pool: ControlPool,
    data_pool: DataPool,
    control_mr: MrHandle,
    blocking_supported: bool,
    active: Arc<AtomicBool>,
    cq_guard: Mutex<()>,
    notification_cb: OnceLock<NotificationCallback>,
    conn_ack_cb: OnceLock<ConnectionAckCallback>,
    conn_req_cb: OnceLock<ConnectionReqCallback>,
    disconnect_cb: OnceLock<DisconnectCallback>,
    xfer_id_cb: OnceLock<XferIdCallback>,
    error_cb: OnceLock<RailErrorCallback>,
}

fn fabric_err(err: FabricError) -> BackendError {
    BackendError::backend(err.to_string())
}

impl Rail {
    /// Bind a rail to `device`, creating its endpoint, pools, and the
    /// control buffer registration.
    pub fn new(domain: &Arc<FabricDomain>, device: &str, rail_id: usize) -> Result<Rail> {
        let endpoint = domain.open_endpoint(device).map_err(fabric_err)?;
        let control_pool = ControlPool::new(rail_id);
        let data_pool = DataPool::new(rail_id);

        let (chunk_addr, chunk_len) = control_pool.chunk();
        let control_mr = domain
            .register_memory(
                device,
                chunk_addr,
                chunk_len,
                AccessFlags::LOCAL_READ | AccessFlags::LOCAL_WRITE,
            )
            .map_err(fabric_err)?;

        let active = Arc::new(AtomicBool::new(false));
        endpoint.cq().set_arrival_flag(Arc::clone(&active));

        // Probed once; constant afterwards.
        let blocking_supported = endpoint.blocking_cq_read_supported();

        debug!(rail = rail_id, device, endpoint = endpoint.name(), "rail created");
        Ok(Rail {
            rail_id,
            device: device.to_string(),
            endpoint,
            control_pool,
            data_pool,
            control_mr,
            blocking_supported,
            active,
            cq_guard: Mutex::new(()),
            notification_cb: OnceLock::new(),
            conn_ack_cb: OnceLock::new(),
            conn_req_cb: OnceLock::new(),
            disconnect_cb: OnceLock::new(),
            xfer_id_cb: OnceLock::new(),
            error_cb: OnceLock::new(),
        })
    }

    /// This rail's endpoint name, published to peers.
    pub fn ep_name(&self) -> &str {
        self.endpoint.name()
    }

    /// Whether the provider supports blocking completion reads.
    pub fn blocking_cq_read_supported(&self) -> bool {
        self.blocking_supported
    }

    /// Activity flag shared with the completion queue; set on post and
    /// on event arrival.
    pub fn active_flag(&self) -> &Arc<AtomicBool> {
        &self.active
    }

    /// The rail's control pool.
    pub fn control_pool(&self) -> &ControlPool {
        &self.control_pool
    }

    /// The rail's data pool.
    pub fn data_pool(&self) -> &DataPool {
        &self.data_pool
    }

    // Memory registration.

    /// Register a buffer on this rail's NIC.
    pub fn register(&self, addr: u64, len: usize, access: AccessFlags) -> Result<MrHandle> {
        self.domain().register_memory(&self.device, addr, len, access).map_err(fabric_err)
    }

    fn domain(&self) -> &Arc<FabricDomain> {
        self.endpoint.domain()
    }

    /// Deregister a buffer from this rail's NIC.
    pub fn deregister(&self, mr: MrHandle) -> Result<()> {
        self.domain().deregister_memory(mr).map_err(fabric_err)
    }

    // Address vector management.

    /// Insert a peer endpoint into the address vector.
    pub fn insert_address(&self, peer_ep_name: &str) -> Result<FabricAddr> {
        self.endpoint.insert_address(peer_ep_name).map_err(fabric_err)
    }

    /// Remove an inserted address. Idempotent.
    pub fn remove_address(&self, addr: FabricAddr) {
        self.endpoint.remove_address(addr);
    }

    // Posting.

    /// Post the populated control slot as a send.
    pub fn post_send(&self, immediate: u32, dest: FabricAddr, slot: usize) -> Result<()> {
        self.active.store(true, Ordering::Release);
        let payload = self.control_pool.payload(slot);
        self.endpoint.post_send(dest, payload, immediate, control_context(slot)).map_err(fabric_err)
    }

    /// Post the control slot's buffer as a receive.
    pub fn post_recv(&self, slot: usize) -> Result<()> {
        self.endpoint
            .post_recv(self.control_pool.buffer_addr(slot), CONTROL_BUFFER_SIZE, control_context(slot))
            .map_err(fabric_err)
    }

    /// Post a one-sided write with immediate data for the data slot.
    #[allow(clippy::too_many_arguments)]
    pub fn post_write(
        &self,
        local_addr: u64,
        len: usize,
        immediate: u32,
        dest: FabricAddr,
        remote_addr: u64,
        remote_key: u64,
        slot: usize,
    ) -> Result<()> {
        self.active.store(true, Ordering::Release);
        self.endpoint
            .post_write(dest, local_addr, len, Some(immediate), remote_addr, remote_key, data_context(slot))
            .map_err(fabric_err)
    }

    /// Post a one-sided read for the data slot.
    pub fn post_read(
        &self,
        local_addr: u64,
        len: usize,
        dest: FabricAddr,
        remote_addr: u64,
        remote_key: u64,
        slot: usize,
    ) -> Result<()> {
        self.active.store(true, Ordering::Release);
        self.endpoint
            .post_read(dest, local_addr, len, remote_addr, remote_key, data_context(slot))
            .map_err(fabric_err)
    }

    /// Pre-post the startup batch of control receives.
    pub fn post_initial_recvs(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            let slot = self.control_pool.allocate(0)?;
            self.control_pool.with(slot, |req| req.op = OpKind::Recv);
            self.post_recv(slot)?;
        }
        Ok(())
    }

    // Callback registration. Each slot is set once at engine wiring.

    /// Register the notification dispatch callback.
    pub fn set_notification_callback(&self, cb: NotificationCallback) {
        let _ = self.notification_cb.set(cb);
    }

    /// Register the connection-ack dispatch callback.
    pub fn set_connection_ack_callback(&self, cb: ConnectionAckCallback) {
        let _ = self.conn_ack_cb.set(cb);
    }

    /// Register the connection-request dispatch callback.
    pub fn set_connection_req_callback(&self, cb: ConnectionReqCallback) {
        let _ = self.conn_req_cb.set(cb);
    }

    /// Register the disconnect dispatch callback.
    pub fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        let _ = self.disconnect_cb.set(cb);
    }

    /// Register the arrived-write tracking callback.
    pub fn set_xfer_id_callback(&self, cb: XferIdCallback) {
        let _ = self.xfer_id_cb.set(cb);
    }

    /// Register the completion-error callback.
    pub fn set_error_callback(&self, cb: RailErrorCallback) {
        let _ = self.error_cb.set(cb);
    }

    // Progress.

    /// Drain the completion queue in batches and dispatch each event.
    /// With `blocking` the call parks on the queue up to a bounded
    /// timeout when it is empty.
    pub fn progress(&self, blocking: bool) -> Result<ProgressOutcome> {
        let _guard = self.cq_guard.lock().unwrap();
        let events = if blocking && self.blocking_supported {
            match self.endpoint.cq().read_blocking(BLOCKING_READ_TIMEOUT) {
                Some(first) => {
                    let mut events = vec![first];
                    events.extend(self.endpoint.cq().drain(CQ_BATCH_SIZE - 1));
                    events
                }
                None => Vec::new(),
            }
        } else {
            self.endpoint.cq().drain(CQ_BATCH_SIZE)
        };

        if events.is_empty() {
            return Ok(ProgressOutcome::Idle);
        }
        for event in events {
            self.dispatch(event);
        }
        Ok(ProgressOutcome::DidWork)
    }

    fn dispatch(&self, event: CompletionEvent) {
        if let Some(err) = event.error {
            self.dispatch_error(event, err);
            return;
        }
        match event.kind {
            CompletionKind::SendDone => {
                let (is_control, slot) = split_context(event.context);
                if is_control {
                    self.control_pool.release(slot);
                } else {
                    warn!(rail = self.rail_id, "send completion with data context ignored");
                }
            }
            CompletionKind::WriteDone | CompletionKind::ReadDone => {
                let (_, slot) = split_context(event.context);
                let completion = self.data_pool.take_completion(slot);
                self.data_pool.release(slot);
                if let Some(cb) = completion {
                    cb(true);
                }
            }
            CompletionKind::RecvData => {
                let (_, slot) = split_context(event.context);
                self.dispatch_control(slot, event);
                // The slot stays in flight as the re-posted receive.
                if let Err(err) = self.post_recv(slot) {
                    error!(rail = self.rail_id, error = %err, "failed to repost control recv");
                    self.control_pool.release(slot);
                }
            }
            CompletionKind::RemoteWrite => {
                let (_, xfer_id_low) = unpack_data_immediate(event.immediate);
                if let Some(cb) = self.xfer_id_cb.get() {
                    cb(xfer_id_low);
                }
            }
        }
    }

    /// A completion in error state never panics: log, release the
    /// request, and let the engine decide about the connection.
    fn dispatch_error(&self, event: CompletionEvent, err: CompletionError) {
        error!(
            rail = self.rail_id,
            kind = ?event.kind,
            error = ?err,
            "completion reported error"
        );
        let (is_control, slot) = split_context(event.context);
        let agent_idx = if is_control {
            let agent_idx = self.control_pool.with(slot, |req| req.peer_agent_idx);
            self.control_pool.release(slot);
            agent_idx
        } else {
            let completion = self.data_pool.take_completion(slot);
            let agent_idx = self.data_pool.with(slot, |req| req.peer_agent_idx);
            self.data_pool.release(slot);
            if let Some(cb) = completion {
                cb(false);
            }
            agent_idx
        };
        if let Some(cb) = self.error_cb.get() {
            cb(agent_idx, err);
        }
    }

    fn dispatch_control(&self, slot: usize, event: CompletionEvent) {
        if event.len == 0 {
            warn!(rail = self.rail_id, "empty control payload dropped");
            return;
        }
        let bytes = self.control_pool.received(slot, event.len);
        let agent_idx = event.immediate as u16;
        let tag = match ControlTag::from_u8(bytes[0]) {
            Ok(tag) => tag,
            Err(err) => {
                warn!(rail = self.rail_id, error = %err, "control payload with bad tag dropped");
                return;
            }
        };
        let payload = &bytes[1..];
        match tag {
            ControlTag::Notification => {
                if let Some(cb) = self.notification_cb.get() {
                    cb(payload);
                }
            }
            ControlTag::ConnectionReq => {
                if let Some(cb) = self.conn_req_cb.get() {
                    if let Err(err) = cb(agent_idx, payload) {
                        error!(rail = self.rail_id, error = %err, "connection request handling failed");
                    }
                }
            }
            ControlTag::ConnectionAck => {
                if let Some(cb) = self.conn_ack_cb.get() {
                    cb(agent_idx, payload);
                }
            }
            ControlTag::DisconnectReq => {
                if let Some(cb) = self.disconnect_cb.get() {
                    cb(agent_idx, payload);
                }
            }
        }
    }
}

impl Drop for Rail {
    fn drop(&mut self) {
        if let Err(err) = self.domain().deregister_memory(self.control_mr) {
            warn!(rail = self.rail_id, error = %err, "control chunk deregistration failed");
        }
    }
}
