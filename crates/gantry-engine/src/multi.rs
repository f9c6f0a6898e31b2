//! Multi-instance engine: one fabric sub-engine per device index.
//!
//! Fans an agent out across `N` independent sub-engines (at least one
//! per GPU). Registration routes by the region's device id and tags
//! the public blob with the owning sub-engine; transfers are split
//! into an `(L x R)` matrix of per-sub-engine descriptor lists. Because
//! the sub-engines progress independently, a completion notification
//! cannot piggy-back on the post: when any cell is still in progress
//! it is deferred to `check_xfer`.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info};

use gantry_api::{
    BackendEngine, BackendError, InitParams, MemoryKind, MemoryRegion, MetaDesc, Notification,
    Result, XferArgs, XferOp, XferStatus,
};
use gantry_fabric::{FabricDomain, SerDes, Topology};

use crate::engine::{FabricEngine, FabricPrivateMd, FabricPublicMd};
use crate::handle::FabricXferHandle;

/// Sub-engine `i` of agent `base` is addressed as `base:i`.
fn engine_name(base: &str, idx: usize) -> String {
    format!("{base}:{idx}")
}

/// Recover the base agent name from a sub-engine name.
fn engine_base(name: &str) -> &str {
    match name.rfind(':') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// Private metadata: the owning sub-engine plus its registration.
#[derive(Debug)]
pub struct MultiPrivateMd {
    eidx: usize,
    inner: FabricPrivateMd,
    public_blob: Vec<u8>,
}

/// Public metadata: the remote owning sub-engine plus one loaded view
/// per local sub-engine.
pub struct MultiPublicMd {
    eidx: usize,
    views: Vec<FabricPublicMd>,
}

#[derive(Debug)]
struct Cell {
    handle: FabricXferHandle,
    lidx: usize,
    ridx: usize,
    in_progress: bool,
}

/// Handle over every prepared matrix cell, plus the deferred
/// notification when one was requested on an in-progress post.
#[derive(Debug)]
pub struct MultiXferHandle {
    peer: String,
    cells: Vec<Cell>,
    deferred_notif: Option<String>,
}

/// Engine variant that fans out across sub-engines per host device.
pub struct MultiFabricEngine {
    agent: String,
    engines: Vec<FabricEngine>,
    // peer base name -> number of remote sub-engines
    remote_counts: Mutex<HashMap<String, usize>>,
}

impl MultiFabricEngine {
    /// Create `max(num_workers, num_gpus)` sub-engines on the domain.
    pub fn new(params: InitParams, domain: &std::sync::Arc<FabricDomain>) -> Result<Self> {
        let topology = Topology::discover(domain, params.config.devices.as_deref())?;
        let count = params.config.num_workers.max(topology.num_gpus()).max(1);

        let mut engines = Vec::with_capacity(count);
        for idx in 0..count {
            let sub_params = InitParams::new(engine_name(&params.agent_name, idx))
                .with_config(params.config.clone());
            engines.push(FabricEngine::new(sub_params, domain)?);
        }
        info!(agent = %params.agent_name, sub_engines = count, "multi-instance engine started");
        Ok(MultiFabricEngine {
            agent: params.agent_name,
            engines,
            remote_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Number of sub-engines.
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    fn remote_count(&self, peer: &str) -> Option<usize> {
        self.remote_counts.lock().unwrap().get(peer).copied()
    }

    /// Sub-engine index owning a region: its device id.
    fn engine_idx(&self, region: &MemoryRegion) -> Result<usize> {
        let idx = region.device_id as usize;
        if idx >= self.engines.len() {
            return Err(BackendError::invalid(format!(
                "device {} has no sub-engine (count {})",
                region.device_id,
                self.engines.len()
            )));
        }
        Ok(idx)
    }

    /// Partition descriptor pairs into matrix cells keyed by
    /// `(local_engine, remote_engine)`, validating per-index lengths.
    fn partition<'a>(
        &self,
        local: &[MetaDesc<'a, MultiPrivateMd>],
        remote: &[MetaDesc<'a, MultiPublicMd>],
        remote_engines: usize,
    ) -> Result<HashMap<(usize, usize), Vec<usize>>> {
        let mut cells: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
        for (i, (l, r)) in local.iter().zip(remote).enumerate() {
            if l.region.len != r.region.len {
                return Err(BackendError::mismatch(format!(
                    "descriptor {i}: local {} bytes vs remote {}",
                    l.region.len, r.region.len
                )));
            }
            let lidx = l.meta.eidx;
            let ridx = r.meta.eidx;
            if lidx >= self.engines.len() || ridx >= remote_engines {
                return Err(BackendError::invalid(format!(
                    "descriptor {i}: engine pair ({lidx}, {ridx}) out of range"
                )));
            }
            cells.entry((lidx, ridx)).or_default().push(i);
        }
        Ok(cells)
    }
}

impl BackendEngine for MultiFabricEngine {
    type PrivateMd = MultiPrivateMd;
    type PublicMd = MultiPublicMd;
    type XferHandle = MultiXferHandle;

    fn supports_remote(&self) -> bool {
        true
    }

    fn supports_local(&self) -> bool {
        false
    }

    fn supports_notif(&self) -> bool {
        true
    }

    fn supported_mems(&self) -> Vec<MemoryKind> {
        vec![MemoryKind::Host, MemoryKind::Device]
    }

    fn register_mem(&self, region: &MemoryRegion) -> Result<MultiPrivateMd> {
        let eidx = self.engine_idx(region)?;
        let inner = self.engines[eidx].register_mem(region)?;
        let inner_blob = self.engines[eidx].get_public_data(&inner)?;

        let mut sd = SerDes::new();
        sd.add_u64("eng_idx", eidx as u64);
        sd.add_buf("blob", &inner_blob);
        Ok(MultiPrivateMd { eidx, inner, public_blob: sd.export() })
    }

    fn deregister_mem(&self, md: MultiPrivateMd) -> Result<()> {
        self.engines[md.eidx].deregister_mem(md.inner)
    }

    fn get_public_data(&self, md: &MultiPrivateMd) -> Result<Vec<u8>> {
        Ok(md.public_blob.clone())
    }

    fn get_conn_info(&self) -> Result<Vec<u8>> {
        let mut sd = SerDes::new();
        sd.add_u64("count", self.engines.len() as u64);
        for (idx, engine) in self.engines.iter().enumerate() {
            sd.add_buf(&format!("value_{idx}"), &engine.get_conn_info()?);
        }
        Ok(sd.export())
    }

    fn load_remote_conn_info(&self, peer: &str, blob: &[u8]) -> Result<()> {
        if self.remote_count(peer).is_some() {
            return Err(BackendError::invalid(format!("peer {peer} already loaded")));
        }
        let sd = SerDes::import(blob).map_err(|e| BackendError::backend(e.to_string()))?;
        let count =
            sd.get_u64("count").map_err(|e| BackendError::mismatch(e.to_string()))? as usize;
        for ridx in 0..count {
            let sub_blob = sd
                .get_buf(&format!("value_{ridx}"))
                .map_err(|e| BackendError::mismatch(e.to_string()))?;
            for engine in &self.engines {
                engine.load_remote_conn_info(&engine_name(peer, ridx), sub_blob)?;
            }
        }
        self.remote_counts.lock().unwrap().insert(peer.to_string(), count);
        debug!(agent = %self.agent, peer, remote_engines = count, "remote conn info loaded");
        Ok(())
    }

    fn connect(&self, peer: &str) -> Result<()> {
        let count = self.remote_count(peer).ok_or_else(|| BackendError::not_found(peer))?;
        for engine in &self.engines {
            for ridx in 0..count {
                engine.connect(&engine_name(peer, ridx))?;
            }
        }
        Ok(())
    }

    fn disconnect(&self, peer: &str) -> Result<()> {
        let count = self.remote_count(peer).ok_or_else(|| BackendError::not_found(peer))?;
        for engine in &self.engines {
            for ridx in 0..count {
                // Sub-connections may have been torn down individually.
                match engine.disconnect(&engine_name(peer, ridx)) {
                    Ok(()) | Err(BackendError::NotFound { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        self.remote_counts.lock().unwrap().remove(peer);
        Ok(())
    }

    fn load_remote_md(
        &self,
        blob: &[u8],
        kind: MemoryKind,
        peer: &str,
    ) -> Result<MultiPublicMd> {
        if self.remote_count(peer).is_none() {
            return Err(BackendError::not_found(peer));
        }
        let sd = SerDes::import(blob).map_err(|e| BackendError::mismatch(e.to_string()))?;
        let eidx =
            sd.get_u64("eng_idx").map_err(|e| BackendError::mismatch(e.to_string()))? as usize;
        let inner_blob =
            sd.get_buf("blob").map_err(|e| BackendError::mismatch(e.to_string()))?;

        let mut views = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            views.push(engine.load_remote_md(inner_blob, kind, &engine_name(peer, eidx))?);
        }
        Ok(MultiPublicMd { eidx, views })
    }

    fn load_local_md(&self, _md: &MultiPrivateMd) -> Result<MultiPublicMd> {
        Err(BackendError::backend("local transfers are not routed through the multi engine"))
    }

    fn unload_md(&self, md: MultiPublicMd) -> Result<()> {
        drop(md);
        Ok(())
    }

    fn prep_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_, MultiPrivateMd>],
        remote: &[MetaDesc<'_, MultiPublicMd>],
        peer: &str,
        _args: Option<&XferArgs>,
    ) -> Result<MultiXferHandle> {
        if local.len() != remote.len() {
            return Err(BackendError::invalid(format!(
                "{} local descriptors vs {} remote",
                local.len(),
                remote.len()
            )));
        }
        let remote_engines =
            self.remote_count(peer).ok_or_else(|| BackendError::not_found(peer))?;
        let cells = self.partition(local, remote, remote_engines)?;

        let mut prepared = Vec::with_capacity(cells.len());
        for ((lidx, ridx), desc_indices) in cells {
            let sub_local: Vec<MetaDesc<'_, FabricPrivateMd>> = desc_indices
                .iter()
                .map(|&i| MetaDesc::new(local[i].region, &local[i].meta.inner))
                .collect();
            let sub_remote: Vec<MetaDesc<'_, FabricPublicMd>> = desc_indices
                .iter()
                .map(|&i| MetaDesc::new(remote[i].region, &remote[i].meta.views[lidx]))
                .collect();
            let handle = self.engines[lidx].prep_xfer(
                op,
                &sub_local,
                &sub_remote,
                &engine_name(peer, ridx),
                None,
            )?;
            prepared.push(Cell { handle, lidx, ridx, in_progress: false });
        }
        Ok(MultiXferHandle { peer: peer.to_string(), cells: prepared, deferred_notif: None })
    }

    fn post_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_, MultiPrivateMd>],
        remote: &[MetaDesc<'_, MultiPublicMd>],
        peer: &str,
        handle: &mut MultiXferHandle,
        args: Option<&XferArgs>,
    ) -> Result<XferStatus> {
        let remote_engines =
            self.remote_count(peer).ok_or_else(|| BackendError::not_found(peer))?;
        let cells = self.partition(local, remote, remote_engines)?;

        let mut any_in_progress = false;
        for cell in &mut handle.cells {
            let desc_indices = cells.get(&(cell.lidx, cell.ridx)).ok_or_else(|| {
                BackendError::invalid("descriptor lists differ from the prepared transfer")
            })?;
            let sub_local: Vec<MetaDesc<'_, FabricPrivateMd>> = desc_indices
                .iter()
                .map(|&i| MetaDesc::new(local[i].region, &local[i].meta.inner))
                .collect();
            let sub_remote: Vec<MetaDesc<'_, FabricPublicMd>> = desc_indices
                .iter()
                .map(|&i| MetaDesc::new(remote[i].region, &remote[i].meta.views[cell.lidx]))
                .collect();
            let status = self.engines[cell.lidx].post_xfer(
                op,
                &sub_local,
                &sub_remote,
                &engine_name(peer, cell.ridx),
                &mut cell.handle,
                None,
            )?;
            if status == XferStatus::InProgress {
                cell.in_progress = true;
                any_in_progress = true;
            }
        }

        // Absent optional arguments mean no notification.
        let notif = args.and_then(|a| a.notif_msg.clone());

        if any_in_progress {
            // Independent sub-engines cannot piggy-back the
            // notification atomically; send it once every cell is
            // flushed, in check_xfer.
            handle.deferred_notif = notif;
            return Ok(XferStatus::InProgress);
        }

        if let Some(msg) = notif {
            self.engines[0].gen_notif(&engine_name(peer, 0), &msg)?;
        }
        Ok(XferStatus::Completed)
    }

    fn check_xfer(&self, handle: &mut MultiXferHandle) -> Result<XferStatus> {
        let mut outcome = XferStatus::Completed;
        for cell in &mut handle.cells {
            if !cell.in_progress {
                continue;
            }
            match self.engines[cell.lidx].check_xfer(&mut cell.handle)? {
                XferStatus::Completed => cell.in_progress = false,
                XferStatus::InProgress => outcome = XferStatus::InProgress,
            }
        }
        if outcome == XferStatus::Completed {
            if let Some(msg) = handle.deferred_notif.take() {
                // Every cell is flushed; the notification is safe now.
                self.engines[0].gen_notif(&engine_name(&handle.peer, 0), &msg)?;
            }
        }
        Ok(outcome)
    }

    fn release_req(&self, handle: MultiXferHandle) -> Result<()> {
        let mut first_err = None;
        for cell in handle.cells {
            if let Err(err) = self.engines[cell.lidx].release_req(cell.handle) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn get_notifs(&self, out: &mut Vec<Notification>) -> Result<XferStatus> {
        let mut sub = Vec::new();
        let status = self.engines[0].get_notifs(&mut sub)?;
        out.extend(sub.into_iter().map(|n| Notification {
            from: engine_base(&n.from).to_string(),
            msg: n.msg,
        }));
        Ok(status)
    }

    fn gen_notif(&self, peer: &str, msg: &str) -> Result<()> {
        if self.remote_count(peer).is_none() {
            return Err(BackendError::not_found(peer));
        }
        self.engines[0].gen_notif(&engine_name(peer, 0), msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_names() {
        assert_eq!(engine_name("agent-a", 2), "agent-a:2");
        assert_eq!(engine_base("agent-a:2"), "agent-a");
        assert_eq!(engine_base("plain"), "plain");
        // Agent names may carry colons; only the last segment is the index.
        assert_eq!(engine_base("host:3000:1"), "host:3000");
    }
}
