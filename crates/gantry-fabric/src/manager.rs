//! Central manager for multi-rail operations.
//!
//! Owns the data and control rails, the topology, and the NIC-to-rail
//! map. Splits logical transfers into per-rail submissions (striping or
//! round-robin), routes control messages, drives progress, and
//! (de)serializes the connection and memory-key blobs that cross the
//! bootstrap channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use gantry_api::{BackendError, EngineConfig, MemoryKind, MemoryRegion, Result};

use crate::pool::{CompletionFn, OpKind};
use crate::rail::{ProgressOutcome, Rail, INITIAL_RECVS_PER_CONTROL_RAIL};
use crate::serdes::SerDes;
use crate::sim::{AccessFlags, FabricAddr, FabricDomain, MrHandle};
use crate::topology::Topology;
use crate::wire::{pack_data_immediate, ControlTag, NotificationRecord};

/// Which rail family an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailType {
    /// High-bandwidth transfer rails.
    Data,
    /// Connection-management and notification rails.
    Control,
}

/// Per-rail registration state for one memory region: three parallel
/// vectors indexed by data-rail id, plus the selected subset.
#[derive(Debug, Default)]
pub struct RegisteredMemory {
    /// Registration handle per rail; `None` on unselected rails.
    pub mrs: Vec<Option<MrHandle>>,
    /// Remote key per rail; zero on unselected rails.
    pub keys: Vec<u64>,
    /// Rail ids the region was registered on.
    pub selected: Vec<usize>,
}

/// Owns all rails and the transfer submission policy.
pub struct RailManager {
    topology: Topology,
    data_rails: Vec<Arc<Rail>>,
    control_rails: Vec<Arc<Rail>>,
    nic_to_rail: HashMap<String, usize>,
    striping_threshold: usize,
    rr_cursor: AtomicUsize,
}

impl RailManager {
    /// Discover the topology and create one data rail per NIC plus the
    /// control rail.
    pub fn new(domain: &Arc<FabricDomain>, config: &EngineConfig) -> Result<RailManager> {
        let topology = Topology::discover(domain, config.devices.as_deref())?;

        let mut data_rails = Vec::new();
        let mut nic_to_rail = HashMap::new();
        for (rail_id, nic) in topology.all_nics().to_vec().iter().enumerate() {
            data_rails.push(Arc::new(Rail::new(domain, nic, rail_id)?));
            nic_to_rail.insert(nic.clone(), rail_id);
        }

        // All connection management and notification traffic flows over
        // control rail 0.
        let control_rail = Arc::new(Rail::new(domain, &topology.all_nics()[0], 0)?);
        control_rail.post_initial_recvs(INITIAL_RECVS_PER_CONTROL_RAIL)?;

        debug!(
            data_rails = data_rails.len(),
            control_rails = 1,
            striping_threshold = config.striping_threshold,
            "rail manager created"
        );

        Ok(RailManager {
            topology,
            data_rails,
            control_rails: vec![control_rail],
            nic_to_rail,
            striping_threshold: config.striping_threshold,
            rr_cursor: AtomicUsize::new(0),
        })
    }

    /// The discovered topology.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of data rails.
    pub fn num_data_rails(&self) -> usize {
        self.data_rails.len()
    }

    /// Number of control rails.
    pub fn num_control_rails(&self) -> usize {
        self.control_rails.len()
    }

    /// Data rail by id.
    pub fn data_rail(&self, rail_id: usize) -> &Arc<Rail> {
        &self.data_rails[rail_id]
    }

    /// Control rail by id.
    pub fn control_rail(&self, rail_id: usize) -> &Arc<Rail> {
        &self.control_rails[rail_id]
    }

    // Rail selection and registration.

    /// Rail ids proximate to the region. Empty selections are errors:
    /// a device region whose GPU has no grouped NIC is a capability
    /// gap, anything else a backend fault.
    pub fn select_rails(&self, region: &MemoryRegion) -> Result<Vec<usize>> {
        let nics = self.topology.nics_for_memory(region);
        let rails: Vec<usize> =
            nics.iter().filter_map(|nic| self.nic_to_rail.get(nic).copied()).collect();
        if rails.is_empty() {
            return match region.kind {
                MemoryKind::Device => Err(BackendError::NotSupported {
                    reason: format!("no rail can reach device {}", region.device_id),
                }),
                MemoryKind::Host => {
                    Err(BackendError::backend("no rail selected for host region"))
                }
            };
        }
        Ok(rails)
    }

    /// Register a region on every selected rail, filling the three
    /// parallel vectors. Rolls back on partial failure.
    pub fn register_memory(&self, region: &MemoryRegion) -> Result<RegisteredMemory> {
        let selected = self.select_rails(region)?;
        let mut reg = RegisteredMemory {
            mrs: vec![None; self.data_rails.len()],
            keys: vec![0; self.data_rails.len()],
            selected: selected.clone(),
        };

        for &rail_id in &selected {
            match self.data_rails[rail_id].register(region.addr, region.len, AccessFlags::ALL) {
                Ok(mr) => {
                    reg.keys[rail_id] = mr.key;
                    reg.mrs[rail_id] = Some(mr);
                }
                Err(err) => {
                    let _ = self.deregister_memory(&reg.selected, &reg.mrs);
                    return Err(err);
                }
            }
        }
        debug!(rails = selected.len(), len = region.len, "memory registered");
        Ok(reg)
    }

    /// Deregister from the selected rails. Continues on error and
    /// reports the first.
    pub fn deregister_memory(&self, selected: &[usize], mrs: &[Option<MrHandle>]) -> Result<()> {
        let mut first_err = None;
        for &rail_id in selected {
            if let Some(mr) = mrs.get(rail_id).copied().flatten() {
                if let Err(err) = self.data_rails[rail_id].deregister(mr) {
                    warn!(rail = rail_id, error = %err, "deregistration failed, continuing");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // Connection management.

    /// Insert the peer's endpoints into every rail of `rail_type`,
    /// returning the per-rail fabric addresses.
    pub fn insert_all_addresses(
        &self,
        rail_type: RailType,
        endpoints: &[String],
    ) -> Result<Vec<FabricAddr>> {
        let rails = self.rails_of(rail_type);
        if endpoints.len() != rails.len() {
            return Err(BackendError::invalid(format!(
                "expected {} endpoints for {:?} rails, got {}",
                rails.len(),
                rail_type,
                endpoints.len()
            )));
        }
        rails
            .iter()
            .zip(endpoints)
            .map(|(rail, ep_name)| rail.insert_address(ep_name))
            .collect()
    }

    /// Remove previously inserted addresses from every rail of
    /// `rail_type`.
    pub fn cleanup_connection(&self, rail_type: RailType, addrs: &[FabricAddr]) {
        for (rail, addr) in self.rails_of(rail_type).iter().zip(addrs) {
            rail.remove_address(*addr);
        }
    }

    fn rails_of(&self, rail_type: RailType) -> &[Arc<Rail>] {
        match rail_type {
            RailType::Data => &self.data_rails,
            RailType::Control => &self.control_rails,
        }
    }

    // Transfer submission.

    /// Whether a transfer of `size` bytes is striped across its rails.
    pub fn should_stripe(&self, size: usize) -> bool {
        size >= self.striping_threshold
    }

    /// Contiguous chunk sizes for a striped transfer: `rails` chunks
    /// whose sizes sum to `size` and differ by at most one byte.
    pub fn stripe_chunks(size: usize, rails: usize) -> Vec<usize> {
        let base = size / rails;
        let rem = size % rails;
        (0..rails).map(|i| base + usize::from(i < rem)).collect()
    }

    /// Split one descriptor's transfer into per-rail chunks and post
    /// them.
    ///
    /// Striped transfers cut the region into one contiguous chunk per
    /// selected rail, sizes differing by at most one byte; smaller
    /// transfers go whole onto the next rail of a rotating cursor.
    /// Every emitted write's transfer id is appended to `notif`.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_and_submit(
        &self,
        op: OpKind,
        local_addr: u64,
        size: usize,
        remote_base: u64,
        selected_rails: &[usize],
        local_mrs: &[Option<MrHandle>],
        remote_keys: &[u64],
        dest_addrs: &[FabricAddr],
        agent_idx: u16,
        completion: CompletionFn,
        notif: &mut NotificationRecord,
    ) -> Result<usize> {
        if selected_rails.is_empty() {
            return Err(BackendError::invalid("transfer over zero rails"));
        }
        let mut chunks: Vec<(usize, usize, usize)> = Vec::new();
        if self.should_stripe(size) {
            let mut offset = 0;
            for (&rail_id, chunk) in
                selected_rails.iter().zip(Self::stripe_chunks(size, selected_rails.len()))
            {
                if chunk == 0 {
                    continue;
                }
                chunks.push((rail_id, offset, chunk));
                offset += chunk;
            }
        } else {
            let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
            chunks.push((selected_rails[cursor % selected_rails.len()], 0, size));
        }

        let mut emitted = 0;
        for (rail_id, offset, chunk) in chunks {
            if local_mrs.get(rail_id).copied().flatten().is_none() {
                return Err(BackendError::invalid(format!(
                    "region not registered on selected rail {rail_id}"
                )));
            }
            let dest = *dest_addrs.get(rail_id).ok_or_else(|| {
                BackendError::invalid(format!("no destination address for rail {rail_id}"))
            })?;

            let rail = &self.data_rails[rail_id];
            let slot = rail.data_pool().allocate(op)?;
            let xfer_id = rail.data_pool().with(slot, |req| {
                req.chunk_offset = offset;
                req.chunk_size = chunk;
                req.local_addr = local_addr + offset as u64;
                req.remote_addr = remote_base + offset as u64;
                req.remote_key = remote_keys[rail_id];
                req.peer_agent_idx = agent_idx;
                req.completion = Some(Arc::clone(&completion));
                req.xfer_id
            });

            // Only writes land with immediate data; reads never surface
            // at the peer, so their ids would gate a notification
            // forever.
            if op == OpKind::Write {
                if let Err(err) = notif.push_xfer_id(xfer_id) {
                    rail.data_pool().release(slot);
                    return Err(BackendError::backend(err.to_string()));
                }
            }

            let posted = match op {
                OpKind::Write => rail.post_write(
                    local_addr + offset as u64,
                    chunk,
                    pack_data_immediate(agent_idx, xfer_id),
                    dest,
                    remote_base + offset as u64,
                    remote_keys[rail_id],
                    slot,
                ),
                OpKind::Read => rail.post_read(
                    local_addr + offset as u64,
                    chunk,
                    dest,
                    remote_base + offset as u64,
                    remote_keys[rail_id],
                    slot,
                ),
                other => Err(BackendError::invalid(format!("{other:?} is not a data operation"))),
            };
            if let Err(err) = posted {
                rail.data_pool().release(slot);
                return Err(err);
            }
            emitted += 1;
        }
        Ok(emitted)
    }

    // Control messaging.

    /// Stamp the tag onto a populated control slot and post it on
    /// control rail 0, with the agent index in the immediate.
    pub fn post_control(
        &self,
        msg_type: ControlTag,
        slot: usize,
        dest: FabricAddr,
        agent_idx: u16,
    ) -> Result<()> {
        let rail = &self.control_rails[0];
        rail.control_pool().set_tag(slot, msg_type as u8);
        rail.control_pool().with(slot, |req| {
            req.op = OpKind::Send;
            req.peer_agent_idx = agent_idx;
        });
        rail.post_send(agent_idx as u32, dest, slot)
    }

    // Progress.

    /// Progress rails that were active since the last sweep.
    pub fn progress_active_data_rails(&self) -> Result<ProgressOutcome> {
        let mut did_work = false;
        for rail in &self.data_rails {
            if rail.active_flag().swap(false, Ordering::AcqRel) {
                if rail.progress(false)? == ProgressOutcome::DidWork {
                    did_work = true;
                    // More completions may be queued behind the batch.
                    rail.active_flag().store(true, Ordering::Release);
                }
            }
        }
        Ok(if did_work { ProgressOutcome::DidWork } else { ProgressOutcome::Idle })
    }

    /// Progress every control rail; with `blocking`, park on the
    /// completion queue when it is empty.
    pub fn progress_all_control_rails(&self, blocking: bool) -> Result<ProgressOutcome> {
        let mut did_work = false;
        for rail in &self.control_rails {
            if rail.progress(blocking)? == ProgressOutcome::DidWork {
                did_work = true;
            }
        }
        Ok(if did_work { ProgressOutcome::DidWork } else { ProgressOutcome::Idle })
    }

    // SerDes.

    /// Serialize every rail endpoint under `prefix` ("src" for the
    /// sender's own endpoints, "dest" for endpoints a receiver should
    /// target).
    pub fn serialize_connection_info(&self, prefix: &str) -> Vec<u8> {
        let mut sd = SerDes::new();
        sd.add_u64("count", self.data_rails.len() as u64);
        for (i, rail) in self.data_rails.iter().enumerate() {
            sd.add_str(&format!("{prefix}data_ep_{i}"), rail.ep_name());
        }
        for (i, rail) in self.control_rails.iter().enumerate() {
            sd.add_str(&format!("{prefix}ctrl_ep_{i}"), rail.ep_name());
        }
        sd.export()
    }

    /// Parse a connection blob serialized under `prefix` into data and
    /// control endpoint lists.
    pub fn deserialize_connection_info(
        prefix: &str,
        blob: &[u8],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let sd = SerDes::import(blob).map_err(|e| BackendError::backend(e.to_string()))?;
        let count =
            sd.get_u64("count").map_err(|e| BackendError::backend(e.to_string()))? as usize;

        let mut data_eps = Vec::with_capacity(count);
        for i in 0..count {
            let ep = sd
                .get_str(&format!("{prefix}data_ep_{i}"))
                .map_err(|e| BackendError::backend(e.to_string()))?;
            data_eps.push(ep);
        }
        let mut ctrl_eps = Vec::new();
        let mut i = 0;
        while sd.contains(&format!("{prefix}ctrl_ep_{i}")) {
            ctrl_eps.push(
                sd.get_str(&format!("{prefix}ctrl_ep_{i}"))
                    .map_err(|e| BackendError::backend(e.to_string()))?,
            );
            i += 1;
        }
        Ok((data_eps, ctrl_eps))
    }

    /// Serialize a region's per-rail remote keys and base address.
    pub fn serialize_memory_keys(keys: &[u64], base_addr: u64) -> Vec<u8> {
        let mut sd = SerDes::new();
        sd.add_u64("base_addr", base_addr);
        for (i, key) in keys.iter().enumerate() {
            sd.add_u64(&format!("key_{i}"), *key);
        }
        sd.export()
    }

    /// Parse a memory blob into `(per-rail keys, base address)`.
    pub fn deserialize_memory_keys(blob: &[u8]) -> Result<(Vec<u64>, u64)> {
        let sd = SerDes::import(blob).map_err(|e| BackendError::mismatch(e.to_string()))?;
        let base_addr =
            sd.get_u64("base_addr").map_err(|e| BackendError::mismatch(e.to_string()))?;
        let mut keys = Vec::new();
        let mut i = 0;
        while sd.contains(&format!("key_{i}")) {
            keys.push(
                sd.get_u64(&format!("key_{i}"))
                    .map_err(|e| BackendError::mismatch(e.to_string()))?,
            );
            i += 1;
        }
        Ok((keys, base_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::NicLocation;

    fn four_rail_manager() -> (Arc<FabricDomain>, RailManager) {
        let domain = FabricDomain::new();
        for i in 0..4 {
            domain.add_nic(&format!("nic{i}"), NicLocation { numa_node: 0, gpu: Some(0) });
        }
        let manager = RailManager::new(&domain, &EngineConfig::default()).unwrap();
        (domain, manager)
    }

    fn register_pair(
        manager: &RailManager,
        local: &[u8],
        remote: &[u8],
    ) -> (RegisteredMemory, RegisteredMemory, Vec<FabricAddr>) {
        let local_reg = manager.register_memory(&MemoryRegion::of_slice(local, 0)).unwrap();
        let remote_reg = manager.register_memory(&MemoryRegion::of_slice(remote, 0)).unwrap();
        // Loop every data rail back to itself for the transfer tests.
        let dests: Vec<FabricAddr> = (0..manager.num_data_rails())
            .map(|i| {
                let rail = manager.data_rail(i);
                rail.insert_address(rail.ep_name()).unwrap()
            })
            .collect();
        (local_reg, remote_reg, dests)
    }

    #[test]
    fn test_rails_created_per_nic() {
        let (_domain, manager) = four_rail_manager();
        assert_eq!(manager.num_data_rails(), 4);
        assert_eq!(manager.num_control_rails(), 1);
    }

    #[test]
    fn test_register_fills_parallel_vectors() {
        let (_domain, manager) = four_rail_manager();
        let buf = vec![0u8; 4096];
        let reg = manager.register_memory(&MemoryRegion::of_slice(&buf, 0)).unwrap();

        assert_eq!(reg.mrs.len(), 4);
        assert_eq!(reg.keys.len(), 4);
        assert_eq!(reg.selected.len(), 4);
        for &rail_id in &reg.selected {
            assert!(reg.mrs[rail_id].is_some());
            assert_ne!(reg.keys[rail_id], 0);
        }
        manager.deregister_memory(&reg.selected, &reg.mrs).unwrap();
    }

    #[test]
    fn test_select_rails_unreachable_device() {
        let (_domain, manager) = four_rail_manager();
        let err = manager.select_rails(&MemoryRegion::device(0, 64, 9)).unwrap_err();
        assert!(matches!(err, BackendError::NotSupported { .. }));
    }

    #[test]
    fn test_striping_partitions_exactly() {
        let (_domain, manager) = four_rail_manager();
        let local = vec![0xAAu8; 8 * 1024 * 1024];
        let remote = vec![0u8; 8 * 1024 * 1024];
        let (local_reg, remote_reg, dests) = register_pair(&manager, &local, &remote);

        let mut notif = NotificationRecord::new("a", "m").unwrap();
        let emitted = manager
            .prepare_and_submit(
                OpKind::Write,
                local.as_ptr() as u64,
                local.len(),
                remote.as_ptr() as u64,
                &local_reg.selected,
                &local_reg.mrs,
                &remote_reg.keys,
                &dests,
                1,
                Arc::new(|_| {}),
                &mut notif,
            )
            .unwrap();

        // 8 MiB over 4 rails at the 1 MiB threshold: one 2 MiB chunk
        // per rail.
        assert_eq!(emitted, 4);
        assert_eq!(notif.xfer_ids.len(), 4);
        while manager.progress_active_data_rails().unwrap() == ProgressOutcome::DidWork {}
        assert_eq!(remote, local);
    }

    #[test]
    fn test_round_robin_rotates() {
        let (_domain, manager) = four_rail_manager();
        let local = vec![1u8; 4096];
        let remote = vec![0u8; 4096];
        let (local_reg, remote_reg, dests) = register_pair(&manager, &local, &remote);

        // Small transfers pick exactly one rail each, rotating.
        for i in 0..8 {
            let mut notif = NotificationRecord::new("a", "m").unwrap();
            manager
                .prepare_and_submit(
                    OpKind::Write,
                    local.as_ptr() as u64,
                    local.len(),
                    remote.as_ptr() as u64,
                    &local_reg.selected,
                    &local_reg.mrs,
                    &remote_reg.keys,
                    &dests,
                    0,
                    Arc::new(|_| {}),
                    &mut notif,
                )
                .unwrap();
            assert_eq!(notif.xfer_ids.len(), 1);
            let expected_rail = i % 4;
            assert_eq!(
                manager.data_rail(expected_rail).data_pool().active_count(),
                1,
                "write {i} should land on rail {expected_rail}"
            );
            while manager.progress_active_data_rails().unwrap() == ProgressOutcome::DidWork {}
        }
    }

    #[test]
    fn test_reads_emit_no_notification_ids() {
        let (_domain, manager) = four_rail_manager();
        let local = vec![0u8; 4096];
        let remote = vec![5u8; 4096];
        let (local_reg, remote_reg, dests) = register_pair(&manager, &local, &remote);

        let mut notif = NotificationRecord::new("a", "m").unwrap();
        manager
            .prepare_and_submit(
                OpKind::Read,
                local.as_ptr() as u64,
                local.len(),
                remote.as_ptr() as u64,
                &local_reg.selected,
                &local_reg.mrs,
                &remote_reg.keys,
                &dests,
                0,
                Arc::new(|_| {}),
                &mut notif,
            )
            .unwrap();
        assert!(notif.xfer_ids.is_empty());
        while manager.progress_active_data_rails().unwrap() == ProgressOutcome::DidWork {}
        assert_eq!(local, remote);
    }

    #[test]
    fn test_connection_info_round_trip() {
        let (_domain, manager) = four_rail_manager();
        for prefix in ["src", "dest"] {
            let blob = manager.serialize_connection_info(prefix);
            let (data_eps, ctrl_eps) =
                RailManager::deserialize_connection_info(prefix, &blob).unwrap();
            assert_eq!(data_eps.len(), 4);
            assert_eq!(ctrl_eps.len(), 1);
            assert_eq!(data_eps[2], manager.data_rail(2).ep_name());
            assert_eq!(ctrl_eps[0], manager.control_rail(0).ep_name());
            // Byte-stable re-serialization.
            assert_eq!(blob, manager.serialize_connection_info(prefix));
        }
    }

    #[test]
    fn test_memory_keys_round_trip() {
        let keys = vec![11, 0, 33, 44];
        let blob = RailManager::serialize_memory_keys(&keys, 0xDEAD_0000);
        let (parsed_keys, base) = RailManager::deserialize_memory_keys(&blob).unwrap();
        assert_eq!(parsed_keys, keys);
        assert_eq!(base, 0xDEAD_0000);
    }

    #[test]
    fn test_insert_all_addresses_count_mismatch() {
        let (_domain, manager) = four_rail_manager();
        let err = manager
            .insert_all_addresses(RailType::Data, &["only-one".to_string()])
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidParam { .. }));
    }

    #[test]
    fn test_pool_conservation_across_transfers() {
        let (_domain, manager) = four_rail_manager();
        let local = vec![2u8; 2 * 1024 * 1024];
        let remote = vec![0u8; 2 * 1024 * 1024];
        let (local_reg, remote_reg, dests) = register_pair(&manager, &local, &remote);

        for _ in 0..5 {
            let mut notif = NotificationRecord::new("a", "m").unwrap();
            manager
                .prepare_and_submit(
                    OpKind::Write,
                    local.as_ptr() as u64,
                    local.len(),
                    remote.as_ptr() as u64,
                    &local_reg.selected,
                    &local_reg.mrs,
                    &remote_reg.keys,
                    &dests,
                    0,
                    Arc::new(|_| {}),
                    &mut notif,
                )
                .unwrap();
            while manager.progress_active_data_rails().unwrap() == ProgressOutcome::DidWork {}
        }
        for i in 0..manager.num_data_rails() {
            assert_eq!(manager.data_rail(i).data_pool().active_count(), 0);
        }
    }
}
