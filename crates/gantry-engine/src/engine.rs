//! The concrete fabric engine.
//!
//! Combines the rail manager with the per-peer connection state
//! machine, two background threads (connection management, optional
//! data progress), transfer-id tracking, and gated notification
//! delivery.
//!
//! Lock order, outermost first: connection table, per-connection
//! state, notification queue. The receiver tracking set is a leaf and
//! never nests inside another engine lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use gantry_api::{
    BackendEngine, BackendError, EngineConfig, ErrHandlingMode, InitParams, MemoryKind,
    MemoryRegion, MetaDesc, Notification, Result, TelemetryQueue, XferArgs, XferOp, XferStatus,
};
use gantry_fabric::{
    ControlTag, CompletionError, FabricDomain, NotificationRecord, OpKind, ProgressOutcome,
    RailManager, RailType, RegisteredMemory, SerDes, NOTIFICATION_RECORD_SIZE,
};

use crate::connection::{Connection, ConnectionState};
use crate::handle::{FabricXferHandle, TransferProgress};

/// Private metadata: the per-rail registrations a local region owns.
#[derive(Debug)]
pub struct FabricPrivateMd {
    region: MemoryRegion,
    reg: RegisteredMemory,
}

impl FabricPrivateMd {
    /// Rail ids this region is registered on.
    pub fn selected_rails(&self) -> &[usize] {
        &self.reg.selected
    }
}

/// Public metadata: a peer-usable view of a remote (or local) region.
/// Never owns registrations.
#[derive(Debug)]
pub struct FabricPublicMd {
    peer: String,
    remote_addr: u64,
    keys: Vec<u64>,
}

struct PendingNotification {
    from: String,
    msg: String,
    expected: HashSet<u16>,
}

struct ConnTable {
    connections: HashMap<String, Arc<Connection>>,
    agent_names: Vec<String>,
}

struct ReceiverTracking {
    received: HashSet<u16>,
    pending: Vec<PendingNotification>,
}

struct EngineShared {
    agent: String,
    config: EngineConfig,
    manager: RailManager,
    telemetry: TelemetryQueue,
    conn: Mutex<ConnTable>,
    notif_queue: Mutex<Vec<Notification>>,
    tracking: Mutex<ReceiverTracking>,
    cm_stop: AtomicBool,
    progress_stop: AtomicBool,
}

/// Multi-rail fabric engine: one instance per agent.
pub struct FabricEngine {
    shared: Arc<EngineShared>,
    cm_thread: Option<JoinHandle<()>>,
    progress_thread: Option<JoinHandle<()>>,
}

impl FabricEngine {
    /// Build the engine: discover rails, wire completion dispatch,
    /// open the self-connection, and start the background threads.
    pub fn new(params: InitParams, domain: &Arc<FabricDomain>) -> Result<FabricEngine> {
        let agent_name = params.agent_name;
        let config = params.config;
        let manager = RailManager::new(domain, &config)?;

        let shared = Arc::new(EngineShared {
            agent: agent_name,
            telemetry: TelemetryQueue::new(config.enable_telemetry),
            config,
            manager,
            conn: Mutex::new(ConnTable { connections: HashMap::new(), agent_names: Vec::new() }),
            notif_queue: Mutex::new(Vec::new()),
            tracking: Mutex::new(ReceiverTracking {
                received: HashSet::new(),
                pending: Vec::new(),
            }),
            cm_stop: AtomicBool::new(false),
            progress_stop: AtomicBool::new(false),
        });

        Self::wire_callbacks(&shared);

        // Self-connection: local transfers share the remote code path.
        let own_data_eps: Vec<String> = (0..shared.manager.num_data_rails())
            .map(|i| shared.manager.data_rail(i).ep_name().to_string())
            .collect();
        let own_ctrl_eps: Vec<String> = (0..shared.manager.num_control_rails())
            .map(|i| shared.manager.control_rail(i).ep_name().to_string())
            .collect();
        let self_conn =
            shared.create_connection(&shared.agent.clone(), own_data_eps, own_ctrl_eps)?;
        self_conn.ensure_addrs(&shared.manager)?;
        self_conn.set_state(ConnectionState::Connected);

        let cm_shared = Arc::clone(&shared);
        let cm_thread = std::thread::Builder::new()
            .name(format!("{}-cm", shared.agent))
            .spawn(move || cm_loop(cm_shared))
            .map_err(|e| BackendError::backend(format!("failed to start CM thread: {e}")))?;

        let progress_thread = if shared.config.enable_progress_thread {
            let progress_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name(format!("{}-progress", shared.agent))
                    .spawn(move || progress_loop(progress_shared))
                    .map_err(|e| {
                        BackendError::backend(format!("failed to start progress thread: {e}"))
                    })?,
            )
        } else {
            None
        };

        info!(
            agent = %shared.agent,
            data_rails = shared.manager.num_data_rails(),
            progress_thread = shared.config.enable_progress_thread,
            "fabric engine started"
        );
        Ok(FabricEngine { shared, cm_thread: Some(cm_thread), progress_thread })
    }

    /// This engine's agent name.
    pub fn agent_name(&self) -> &str {
        &self.shared.agent
    }

    /// Number of data rails the engine runs.
    pub fn num_data_rails(&self) -> usize {
        self.shared.manager.num_data_rails()
    }

    /// Number of GPUs the topology groups NICs under.
    pub fn num_gpus(&self) -> usize {
        self.shared.manager.topology().num_gpus()
    }

    /// Drain recorded telemetry events.
    pub fn take_telemetry(&self) -> Vec<gantry_api::TelemetryEvent> {
        self.shared.telemetry.take()
    }

    /// Data requests currently in flight across every rail.
    pub fn data_requests_in_flight(&self) -> usize {
        (0..self.shared.manager.num_data_rails())
            .map(|i| self.shared.manager.data_rail(i).data_pool().active_count())
            .sum()
    }

    fn wire_callbacks(shared: &Arc<EngineShared>) {
        let control = shared.manager.control_rail(0);

        let weak = Arc::downgrade(shared);
        control.set_notification_callback(Box::new(move |payload| {
            if let Some(shared) = weak.upgrade() {
                shared.process_notification(payload);
            }
        }));

        let weak = Arc::downgrade(shared);
        control.set_connection_ack_callback(Box::new(move |agent_idx, _payload| {
            if let Some(shared) = weak.upgrade() {
                shared.process_connection_ack(agent_idx);
            }
        }));

        let weak = Arc::downgrade(shared);
        control.set_connection_req_callback(Box::new(move |agent_idx, payload| {
            match weak.upgrade() {
                Some(shared) => shared.process_connection_request(agent_idx, payload),
                None => Ok(()),
            }
        }));

        let weak = Arc::downgrade(shared);
        control.set_disconnect_callback(Box::new(move |_agent_idx, payload| {
            if let Some(shared) = weak.upgrade() {
                shared.process_disconnect(payload);
            }
        }));

        for rail_id in 0..shared.manager.num_data_rails() {
            let weak = Arc::downgrade(shared);
            shared.manager.data_rail(rail_id).set_xfer_id_callback(Box::new(move |xfer_id_low| {
                if let Some(shared) = weak.upgrade() {
                    shared.add_received_xfer_id(xfer_id_low);
                }
            }));

            let weak = Arc::downgrade(shared);
            shared.manager.data_rail(rail_id).set_error_callback(Box::new(
                move |agent_idx, err| {
                    if let Some(shared) = weak.upgrade() {
                        shared.process_completion_error(agent_idx, err);
                    }
                },
            ));
        }
    }
}

impl Drop for FabricEngine {
    fn drop(&mut self) {
        self.shared.cm_stop.store(true, Ordering::SeqCst);
        self.shared.progress_stop.store(true, Ordering::SeqCst);

        // A self-addressed disconnect unblocks a CM thread parked in a
        // blocking completion read.
        self.shared.post_shutdown_wakeup();

        if let Some(handle) = self.cm_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.progress_thread.take() {
            let _ = handle.join();
        }
        debug!(agent = %self.shared.agent, "fabric engine stopped");
    }
}

fn cm_loop(shared: Arc<EngineShared>) {
    debug!(agent = %shared.agent, "CM thread running");
    let blocking = shared.manager.control_rail(0).blocking_cq_read_supported();
    while !shared.cm_stop.load(Ordering::SeqCst) {
        match shared.manager.progress_all_control_rails(blocking) {
            Ok(_) => {}
            Err(err) => {
                // Background threads log and continue, never propagate.
                error!(agent = %shared.agent, error = %err, "control rail progress failed");
            }
        }
        if !blocking {
            std::thread::sleep(Duration::from_nanos(10));
        }
    }
    debug!(agent = %shared.agent, "CM thread exiting");
}

fn progress_loop(shared: Arc<EngineShared>) {
    debug!(agent = %shared.agent, "progress thread running");
    let idle_delay = Duration::from_micros(shared.config.progress_thread_delay_us);
    while !shared.progress_stop.load(Ordering::SeqCst) {
        match shared.manager.progress_active_data_rails() {
            Ok(ProgressOutcome::DidWork) => {}
            Ok(ProgressOutcome::Idle) => std::thread::sleep(idle_delay),
            Err(err) => {
                error!(agent = %shared.agent, error = %err, "data rail progress failed");
                std::thread::sleep(idle_delay);
            }
        }
    }
    debug!(agent = %shared.agent, "progress thread exiting");
}

impl EngineShared {
    fn lookup_conn(&self, peer: &str) -> Option<Arc<Connection>> {
        self.conn.lock().unwrap().connections.get(peer).cloned()
    }

    fn agent_name_for(&self, agent_idx: u16) -> Option<String> {
        self.conn.lock().unwrap().agent_names.get(agent_idx as usize).cloned()
    }

    /// Create (or return) the connection record for `peer`. The record
    /// starts `Disconnected` with no inserted addresses.
    fn create_connection(
        &self,
        peer: &str,
        data_eps: Vec<String>,
        ctrl_eps: Vec<String>,
    ) -> Result<Arc<Connection>> {
        if data_eps.len() != self.manager.num_data_rails() {
            return Err(BackendError::invalid(format!(
                "expected {} data endpoints, got {}",
                self.manager.num_data_rails(),
                data_eps.len()
            )));
        }
        if ctrl_eps.len() != self.manager.num_control_rails() {
            return Err(BackendError::invalid(format!(
                "expected {} control endpoints, got {}",
                self.manager.num_control_rails(),
                ctrl_eps.len()
            )));
        }

        let mut table = self.conn.lock().unwrap();
        if let Some(existing) = table.connections.get(peer) {
            return Ok(Arc::clone(existing));
        }
        let agent_index = match table.agent_names.iter().position(|name| name == peer) {
            Some(idx) => idx as u16,
            None => {
                if table.agent_names.len() > u16::MAX as usize {
                    return Err(BackendError::backend("agent table full"));
                }
                table.agent_names.push(peer.to_string());
                (table.agent_names.len() - 1) as u16
            }
        };
        let conn = Arc::new(Connection::new(peer.to_string(), agent_index, data_eps, ctrl_eps));
        table.connections.insert(peer.to_string(), Arc::clone(&conn));
        debug!(agent = %self.agent, peer, agent_index, "connection record created");
        Ok(conn)
    }

    /// The connection-request/disconnect payload: this agent's name
    /// plus its `src`-prefixed endpoints.
    fn src_info_payload(&self) -> Vec<u8> {
        let blob = self.manager.serialize_connection_info("src");
        let mut sd = SerDes::import(&blob).expect("own blob parses");
        sd.add_str("agent", &self.agent);
        sd.export()
    }

    fn post_control_payload(
        &self,
        tag: ControlTag,
        payload: &[u8],
        dest: gantry_fabric::FabricAddr,
        agent_idx: u16,
    ) -> Result<()> {
        let pool = self.manager.control_rail(0).control_pool();
        let slot = pool.allocate(payload.len())?;
        pool.write_payload(slot, payload);
        if let Err(err) = self.manager.post_control(tag, slot, dest, agent_idx) {
            pool.release(slot);
            return Err(err);
        }
        Ok(())
    }

    /// Blocking connection establishment: send the request and wait on
    /// the connection's condition variable for the CM thread to
    /// observe the acknowledgment.
    fn establish(&self, conn: &Arc<Connection>) -> Result<()> {
        let addrs = conn.ensure_addrs(&self.manager)?;
        conn.set_state(ConnectionState::ConnectReqSent);
        self.post_control_payload(
            ControlTag::ConnectionReq,
            &self.src_info_payload(),
            addrs.control[0],
            conn.agent_index,
        )?;

        debug!(agent = %self.agent, peer = %conn.peer, "waiting for connection");
        let state = conn.wait_resolved(Duration::from_millis(self.config.connect_timeout_ms));
        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => {
                Err(BackendError::backend(format!("connection to {} failed", conn.peer)))
            }
            other => {
                warn!(agent = %self.agent, peer = %conn.peer, state = %other, "connect timed out");
                conn.set_state(ConnectionState::Failed);
                Err(BackendError::backend(format!("connection to {} timed out", conn.peer)))
            }
        }
    }

    // Control-plane ingest, invoked from rail dispatch on the CM thread.

    fn process_connection_ack(&self, agent_idx: u16) {
        let Some(peer) = self.agent_name_for(agent_idx) else {
            warn!(agent = %self.agent, agent_idx, "ack for unknown agent index dropped");
            return;
        };
        if let Some(conn) = self.lookup_conn(&peer) {
            // Only a request we actually sent resolves on this edge; a
            // crossed or duplicate ack finds the record already settled.
            if conn.transition(ConnectionState::ConnectReqSent, ConnectionState::Connected) {
                debug!(agent = %self.agent, peer = %peer, "connection acknowledged");
            } else {
                debug!(
                    agent = %self.agent,
                    peer = %peer,
                    state = %conn.state(),
                    "acknowledgment ignored, connection already resolved"
                );
            }
        }
    }

    fn process_connection_request(&self, initiator_idx: u16, payload: &[u8]) -> Result<()> {
        let sd = SerDes::import(payload).map_err(|e| BackendError::backend(e.to_string()))?;
        let peer = sd.get_str("agent").map_err(|e| BackendError::backend(e.to_string()))?;
        let (data_eps, ctrl_eps) = RailManager::deserialize_connection_info("src", payload)?;

        // The record may predate this request (metadata already
        // loaded) or be created here from the request's endpoints.
        let conn = self.create_connection(&peer, data_eps, ctrl_eps)?;
        let addrs = conn.ensure_addrs(&self.manager)?;
        conn.set_state(ConnectionState::ConnectAckSent);

        // The record must read Connected before the initiator can
        // observe the acknowledgment.
        conn.set_state(ConnectionState::Connected);
        let own_ep = self.manager.control_rail(0).ep_name().as_bytes().to_vec();
        self.post_control_payload(ControlTag::ConnectionAck, &own_ep, addrs.control[0], initiator_idx)?;
        debug!(agent = %self.agent, peer = %peer, "connection request acknowledged");
        Ok(())
    }

    fn process_disconnect(&self, payload: &[u8]) {
        let peer = SerDes::import(payload).ok().and_then(|sd| sd.get_str("agent").ok());
        let Some(peer) = peer else {
            warn!(agent = %self.agent, "disconnect with unreadable payload dropped");
            return;
        };
        if peer == self.agent {
            // Self-addressed shutdown wake-up.
            return;
        }
        if let Some(conn) = self.lookup_conn(&peer) {
            if let Some(addrs) = conn.take_addrs() {
                self.manager.cleanup_connection(RailType::Data, &addrs.data);
                self.manager.cleanup_connection(RailType::Control, &addrs.control);
            }
            conn.set_state(ConnectionState::Disconnected);
            info!(agent = %self.agent, peer = %peer, "peer disconnected");
        }
    }

    fn process_completion_error(&self, agent_idx: u16, err: CompletionError) {
        if self.config.err_handling_mode != ErrHandlingMode::Peer {
            return;
        }
        if err != CompletionError::RemoteDisconnect {
            return;
        }
        let Some(peer) = self.agent_name_for(agent_idx) else { return };
        if let Some(conn) = self.lookup_conn(&peer) {
            // Remote side went away mid-transfer.
            conn.set_state(ConnectionState::Disconnected);
            warn!(agent = %self.agent, peer = %peer, "connection dropped by peer");
        }
    }

    // Notification ingest and transfer-id tracking.

    fn process_notification(&self, payload: &[u8]) {
        let record = match NotificationRecord::decode(payload) {
            Ok(record) => record,
            Err(err) => {
                error!(agent = %self.agent, error = %err, "malformed notification dropped");
                return;
            }
        };
        let expected = record.expected_low_ids();
        if expected.is_empty() {
            self.notif_queue
                .lock()
                .unwrap()
                .push(Notification { from: record.agent, msg: record.message });
            return;
        }

        let deliver = {
            let mut tracking = self.tracking.lock().unwrap();
            if expected.iter().all(|id| tracking.received.contains(id)) {
                for id in &expected {
                    tracking.received.remove(id);
                }
                true
            } else {
                debug!(
                    agent = %self.agent,
                    from = %record.agent,
                    expected = expected.len(),
                    "notification queued until writes arrive"
                );
                tracking.pending.push(PendingNotification {
                    from: record.agent.clone(),
                    msg: record.message.clone(),
                    expected,
                });
                false
            }
        };
        if deliver {
            self.notif_queue
                .lock()
                .unwrap()
                .push(Notification { from: record.agent, msg: record.message });
        }
    }

    fn add_received_xfer_id(&self, xfer_id_low: u16) {
        let ready: Vec<Notification> = {
            let mut tracking = self.tracking.lock().unwrap();
            tracking.received.insert(xfer_id_low);

            let mut ready = Vec::new();
            let mut remaining = Vec::with_capacity(tracking.pending.len());
            let pending = std::mem::take(&mut tracking.pending);
            for entry in pending {
                if entry.expected.iter().all(|id| tracking.received.contains(id)) {
                    for id in &entry.expected {
                        tracking.received.remove(id);
                    }
                    ready.push(Notification { from: entry.from, msg: entry.msg });
                } else {
                    remaining.push(entry);
                }
            }
            tracking.pending = remaining;
            ready
        };
        if !ready.is_empty() {
            self.notif_queue.lock().unwrap().extend(ready);
        }
    }

    /// Depth of the pending (gated) notification queue.
    fn pending_notifications(&self) -> usize {
        self.tracking.lock().unwrap().pending.len()
    }

    fn post_shutdown_wakeup(&self) {
        let Some(conn) = self.lookup_conn(&self.agent) else {
            return;
        };
        let Ok(addrs) = conn.addrs() else {
            return;
        };
        if let Err(err) = self.post_control_payload(
            ControlTag::DisconnectReq,
            &self.src_info_payload(),
            addrs.control[0],
            conn.agent_index,
        ) {
            warn!(agent = %self.agent, error = %err, "shutdown wake-up post failed");
        }
    }

    fn drive_data_progress(&self) -> Result<()> {
        if !self.config.enable_progress_thread {
            self.manager.progress_active_data_rails()?;
        }
        Ok(())
    }
}

impl BackendEngine for FabricEngine {
    type PrivateMd = FabricPrivateMd;
    type PublicMd = FabricPublicMd;
    type XferHandle = FabricXferHandle;

    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_local(&self) -> bool {
        true
    }

    fn supports_notif(&self) -> bool {
        true
    }

    fn supported_mems(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::Host, MemoryKind::Device]
    }

    fn register_mem(&self, region: &MemoryRegion) -> Result<FabricPrivateMd> {
        let reg = self.shared.manager.register_memory(region)?;
        self.shared.telemetry.record("register_mem_bytes", region.len as u64);
        Ok(FabricPrivateMd { region: *region, reg })
    }

    fn deregister_mem(&self, md: FabricPrivateMd) -> Result<()> {
        self.shared.manager.deregister_memory(&md.reg.selected, &md.reg.mrs)
    }

    fn get_public_data(&self, md: &FabricPrivateMd) -> Result<Vec<u8>> {
        Ok(RailManager::serialize_memory_keys(&md.reg.keys, md.region.addr))
    }

    fn get_conn_info(&self) -> Result<Vec<u8>> {
        Ok(self.shared.manager.serialize_connection_info("dest"))
    }

    fn load_remote_conn_info(&self, peer: &str, blob: &[u8]) -> Result<()> {
        if peer.is_empty() {
            return Err(BackendError::invalid("empty peer name"));
        }
        if blob.is_empty() {
            return Err(BackendError::invalid("empty connection info"));
        }
        let (data_eps, ctrl_eps) = RailManager::deserialize_connection_info("dest", blob)?;
        let conn = self.shared.create_connection(peer, data_eps, ctrl_eps)?;
        conn.ensure_addrs(&self.shared.manager)?;
        Ok(())
    }

    fn connect(&self, peer: &str) -> Result<()> {
        let conn =
            self.shared.lookup_conn(peer).ok_or_else(|| BackendError::not_found(peer))?;
        match conn.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => {
                Err(BackendError::backend(format!("connection to {peer} is failed")))
            }
            _ => self.shared.establish(&conn),
        }
    }

    fn disconnect(&self, peer: &str) -> Result<()> {
        let conn =
            self.shared.lookup_conn(peer).ok_or_else(|| BackendError::not_found(peer))?;
        if conn.state() == ConnectionState::Disconnected {
            // Second disconnect of an already-torn-down peer.
            return Err(BackendError::not_found(peer));
        }

        if peer != self.shared.agent {
            // Fire-and-forget: local cleanup proceeds regardless.
            match conn.addrs() {
                Ok(addrs) => {
                    if let Err(err) = self.shared.post_control_payload(
                        ControlTag::DisconnectReq,
                        &self.shared.src_info_payload(),
                        addrs.control[0],
                        conn.agent_index,
                    ) {
                        warn!(peer, error = %err, "disconnect notification failed, cleaning up anyway");
                    }
                }
                Err(err) => {
                    warn!(peer, error = %err, "no addresses for disconnect notification");
                }
            }
        }

        if let Some(addrs) = conn.take_addrs() {
            self.shared.manager.cleanup_connection(RailType::Data, &addrs.data);
            self.shared.manager.cleanup_connection(RailType::Control, &addrs.control);
        }
        conn.set_state(ConnectionState::Disconnected);
        info!(agent = %self.shared.agent, peer, "disconnected");
        Ok(())
    }

    fn load_remote_md(
        &self,
        blob: &[u8],
        _kind: MemoryKind,
        peer: &str,
    ) -> Result<FabricPublicMd> {
        if self.shared.lookup_conn(peer).is_none() {
            return Err(BackendError::not_found(peer));
        }
        let (keys, remote_addr) = RailManager::deserialize_memory_keys(blob)?;
        if keys.len() != self.shared.manager.num_data_rails() {
            return Err(BackendError::mismatch(format!(
                "remote blob has {} rail keys, engine has {} rails",
                keys.len(),
                self.shared.manager.num_data_rails()
            )));
        }
        Ok(FabricPublicMd { peer: peer.to_string(), remote_addr, keys })
    }

    fn load_local_md(&self, md: &FabricPrivateMd) -> Result<FabricPublicMd> {
        Ok(FabricPublicMd {
            peer: self.shared.agent.clone(),
            remote_addr: md.region.addr,
            keys: md.reg.keys.clone(),
        })
    }

    fn unload_md(&self, md: FabricPublicMd) -> Result<()> {
        drop(md);
        Ok(())
    }

    fn prep_xfer(
        &self,
        _op: XferOp,
        local: &[MetaDesc<'_, FabricPrivateMd>],
        remote: &[MetaDesc<'_, FabricPublicMd>],
        peer: &str,
        _args: Option<&XferArgs>,
    ) -> Result<FabricXferHandle> {
        if local.len() != remote.len() {
            return Err(BackendError::mismatch(format!(
                "{} local descriptors vs {} remote",
                local.len(),
                remote.len()
            )));
        }
        for (i, (l, r)) in local.iter().zip(remote).enumerate() {
            if l.region.len != r.region.len {
                return Err(BackendError::mismatch(format!(
                    "descriptor {i}: local {} bytes vs remote {}",
                    l.region.len, r.region.len
                )));
            }
        }
        if self.shared.lookup_conn(peer).is_none() {
            return Err(BackendError::not_found(peer));
        }
        Ok(FabricXferHandle::new(peer.to_string()))
    }

    fn post_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_, FabricPrivateMd>],
        remote: &[MetaDesc<'_, FabricPublicMd>],
        peer: &str,
        handle: &mut FabricXferHandle,
        args: Option<&XferArgs>,
    ) -> Result<XferStatus> {
        if handle.peer() != peer {
            return Err(BackendError::invalid(format!(
                "handle prepared for {}, posted to {peer}",
                handle.peer()
            )));
        }
        let conn =
            self.shared.lookup_conn(peer).ok_or_else(|| BackendError::not_found(peer))?;
        match conn.state() {
            ConnectionState::Connected => {}
            ConnectionState::Failed => {
                return Err(BackendError::backend(format!("connection to {peer} is failed")))
            }
            _ => self.shared.establish(&conn)?,
        }
        let addrs = conn.addrs()?;

        let op_kind = match op {
            XferOp::Write => OpKind::Write,
            XferOp::Read => OpKind::Read,
        };

        let mut record = NotificationRecord::default();
        let upper_bound = (local.len() * self.shared.manager.num_data_rails()) as u32;
        handle.progress.init(upper_bound);

        let progress: Arc<TransferProgress> = Arc::clone(&handle.progress);
        let completion: gantry_fabric::CompletionFn =
            Arc::new(move |ok: bool| progress.mark(ok));

        let mut emitted: u32 = 0;
        let mut total_bytes: u64 = 0;
        for (i, (l, r)) in local.iter().zip(remote).enumerate() {
            if r.meta.peer != peer {
                return Err(BackendError::mismatch(format!(
                    "descriptor {i} targets {}, transfer targets {peer}",
                    r.meta.peer
                )));
            }
            emitted += self.shared.manager.prepare_and_submit(
                op_kind,
                l.region.addr,
                l.region.len,
                r.region.addr,
                &l.meta.reg.selected,
                &l.meta.reg.mrs,
                &r.meta.keys,
                &addrs.data,
                conn.agent_index,
                Arc::clone(&completion),
                &mut record,
            )? as u32;
            total_bytes += l.region.len as u64;
        }
        handle.progress.adjust_total(emitted);
        self.shared.telemetry.record("post_xfer_bytes", total_bytes);

        if let Some(args) = args {
            if let Some(msg) = &args.notif_msg {
                if self.shared.agent.len() > gantry_fabric::AGENT_NAME_LEN
                    || msg.len() > gantry_fabric::MESSAGE_LEN
                {
                    // No partial send for an oversized record.
                    return Err(BackendError::backend("notification fields exceed record"));
                }
                record.agent = self.shared.agent.clone();
                record.message = msg.clone();
                let payload = record.encode();
                self.shared.post_control_payload(
                    ControlTag::Notification,
                    &payload,
                    addrs.control[0],
                    conn.agent_index,
                )?;
            }
        }

        self.shared.drive_data_progress()?;

        if handle.progress.is_failed() {
            return Err(BackendError::backend("transfer failed"));
        }
        if handle.progress.is_completed() {
            Ok(XferStatus::Completed)
        } else {
            Ok(XferStatus::InProgress)
        }
    }

    fn check_xfer(&self, handle: &mut FabricXferHandle) -> Result<XferStatus> {
        self.shared.drive_data_progress()?;
        if handle.progress.is_failed() {
            return Err(BackendError::backend("transfer failed"));
        }
        if handle.progress.is_completed() {
            Ok(XferStatus::Completed)
        } else {
            Ok(XferStatus::InProgress)
        }
    }

    fn release_req(&self, handle: FabricXferHandle) -> Result<()> {
        // In-flight chunks keep their own reference to the counters.
        drop(handle);
        Ok(())
    }

    fn get_notifs(&self, out: &mut Vec<Notification>) -> Result<XferStatus> {
        self.shared.drive_data_progress()?;
        let drained = std::mem::take(&mut *self.shared.notif_queue.lock().unwrap());
        if drained.is_empty() {
            return Ok(XferStatus::InProgress);
        }
        out.extend(drained);
        Ok(XferStatus::Completed)
    }

    fn gen_notif(&self, peer: &str, msg: &str) -> Result<()> {
        let conn =
            self.shared.lookup_conn(peer).ok_or_else(|| BackendError::not_found(peer))?;
        let addrs = conn.ensure_addrs(&self.shared.manager)?;
        let record = NotificationRecord::new(&self.shared.agent, msg)
            .map_err(|e| BackendError::backend(e.to_string()))?;
        debug_assert_eq!(record.encode().len(), NOTIFICATION_RECORD_SIZE);
        self.shared.post_control_payload(
            ControlTag::Notification,
            &record.encode(),
            addrs.control[0],
            conn.agent_index,
        )?;
        self.shared.telemetry.record("gen_notif", 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_fabric::NicLocation;

    fn test_domain(nics: usize) -> Arc<FabricDomain> {
        let domain = FabricDomain::new();
        for i in 0..nics {
            domain.add_nic(&format!("nic{i}"), NicLocation { numa_node: 0, gpu: None });
        }
        domain
    }

    fn engine(name: &str, domain: &Arc<FabricDomain>) -> FabricEngine {
        FabricEngine::new(InitParams::new(name), domain).unwrap()
    }

    #[test]
    fn test_self_connection_at_construction() {
        let domain = test_domain(2);
        let eng = engine("solo", &domain);
        let conn = eng.shared.lookup_conn("solo").unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_unknown_peer_not_found() {
        let domain = test_domain(1);
        let eng = engine("a", &domain);
        assert!(matches!(eng.connect("ghost"), Err(BackendError::NotFound { .. })));
    }

    #[test]
    fn test_handshake_between_engines() {
        let domain = test_domain(2);
        let a = engine("a", &domain);
        let b = engine("b", &domain);

        a.load_remote_conn_info("b", &b.get_conn_info().unwrap()).unwrap();
        b.load_remote_conn_info("a", &a.get_conn_info().unwrap()).unwrap();

        a.connect("b").unwrap();
        assert_eq!(a.shared.lookup_conn("b").unwrap().state(), ConnectionState::Connected);
        // The target flipped its own record too.
        assert_eq!(b.shared.lookup_conn("a").unwrap().state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_twice_is_not_found() {
        let domain = test_domain(1);
        let a = engine("da", &domain);
        let b = engine("db", &domain);
        a.load_remote_conn_info("db", &b.get_conn_info().unwrap()).unwrap();
        b.load_remote_conn_info("da", &a.get_conn_info().unwrap()).unwrap();
        a.connect("db").unwrap();

        a.disconnect("db").unwrap();
        assert!(matches!(a.disconnect("db"), Err(BackendError::NotFound { .. })));
    }

    #[test]
    fn test_notification_gating_out_of_order_arrival() {
        let domain = test_domain(1);
        let eng = engine("gate", &domain);

        // A notification expecting three writes, observed before any
        // immediate has arrived.
        let mut record = NotificationRecord::new("peer", "payload-ready").unwrap();
        for id in [2u32, 0, 1] {
            record.push_xfer_id(id).unwrap();
        }
        eng.shared.process_notification(&record.encode());
        assert_eq!(eng.shared.pending_notifications(), 1);

        // Arrivals out of order: 2, 0 — still gated.
        eng.shared.add_received_xfer_id(2);
        eng.shared.add_received_xfer_id(0);
        assert_eq!(eng.shared.pending_notifications(), 1);
        let mut out = Vec::new();
        assert_eq!(eng.get_notifs(&mut out).unwrap(), XferStatus::InProgress);

        // The last id releases it.
        eng.shared.add_received_xfer_id(1);
        assert_eq!(eng.shared.pending_notifications(), 0);
        assert_eq!(eng.get_notifs(&mut out).unwrap(), XferStatus::Completed);
        assert_eq!(out, vec![Notification { from: "peer".into(), msg: "payload-ready".into() }]);
    }

    #[test]
    fn test_notification_without_ids_delivers_immediately() {
        let domain = test_domain(1);
        let eng = engine("imm", &domain);
        let record = NotificationRecord::new("peer", "hello").unwrap();
        eng.shared.process_notification(&record.encode());

        let mut out = Vec::new();
        assert_eq!(eng.get_notifs(&mut out).unwrap(), XferStatus::Completed);
        assert_eq!(out[0].msg, "hello");
    }

    #[test]
    fn test_malformed_notification_dropped() {
        let domain = test_domain(1);
        let eng = engine("mal", &domain);
        eng.shared.process_notification(&[1, 2, 3]);
        let mut out = Vec::new();
        assert_eq!(eng.get_notifs(&mut out).unwrap(), XferStatus::InProgress);
        assert!(out.is_empty());
    }

    #[test]
    fn test_delivered_ids_are_consumed() {
        let domain = test_domain(1);
        let eng = engine("consume", &domain);

        eng.shared.add_received_xfer_id(5);
        let mut record = NotificationRecord::new("peer", "first").unwrap();
        record.push_xfer_id(5).unwrap();
        eng.shared.process_notification(&record.encode());

        let mut out = Vec::new();
        assert_eq!(eng.get_notifs(&mut out).unwrap(), XferStatus::Completed);

        // A second notification on the same id waits for a fresh write.
        let mut record = NotificationRecord::new("peer", "second").unwrap();
        record.push_xfer_id(5).unwrap();
        eng.shared.process_notification(&record.encode());
        assert_eq!(eng.shared.pending_notifications(), 1);
        eng.shared.add_received_xfer_id(5);
        assert_eq!(eng.shared.pending_notifications(), 0);
    }

    #[test]
    fn test_prep_xfer_validates_counts_and_lengths() {
        let domain = test_domain(1);
        let a = engine("va", &domain);

        let buf = vec![0u8; 128];
        let md = a.register_mem(&MemoryRegion::of_slice(&buf, 0)).unwrap();
        let public = a.load_local_md(&md).unwrap();

        let local = [MetaDesc::new(MemoryRegion::of_slice(&buf, 0), &md)];
        let err = a.prep_xfer(XferOp::Write, &local, &[], "va", None).unwrap_err();
        assert!(matches!(err, BackendError::Mismatch { .. }));

        let remote = [MetaDesc::new(MemoryRegion { len: 64, ..MemoryRegion::of_slice(&buf, 0) }, &public)];
        let err = a.prep_xfer(XferOp::Write, &local, &remote, "va", None).unwrap_err();
        assert!(matches!(err, BackendError::Mismatch { .. }));
    }
}
