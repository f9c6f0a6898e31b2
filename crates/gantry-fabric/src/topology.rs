//! NIC/GPU/NUMA topology discovery.
//!
//! Groups NICs around their nearest GPU and their NUMA node so rail
//! selection can keep transfers close to the memory they touch. When
//! any NIC lacks placement data the whole topology falls back to a
//! uniform mapping where every memory sees every NIC.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use gantry_api::{BackendError, MemoryKind, MemoryRegion, Result};

use crate::sim::FabricDomain;

/// Discovered placement of NICs relative to GPUs and NUMA nodes.
#[derive(Debug)]
pub struct Topology {
    gpu_to_nics: BTreeMap<u32, Vec<String>>,
    numa_to_nics: BTreeMap<u32, Vec<String>>,
    all_nics: Vec<String>,
    discovered: bool,
}

impl Topology {
    /// Discover the domain's NICs, optionally restricted to `filter`.
    ///
    /// Fails only when no NIC survives the filter; missing placement
    /// data degrades to the uniform fallback instead.
    pub fn discover(domain: &FabricDomain, filter: Option<&[String]>) -> Result<Topology> {
        let nics: Vec<_> = domain
            .nics()
            .into_iter()
            .filter(|(name, _)| match filter {
                Some(allowed) => allowed.iter().any(|a| a == name),
                None => true,
            })
            .collect();

        if nics.is_empty() {
            return Err(BackendError::backend("no NICs available after device filter"));
        }

        let all_nics: Vec<String> = nics.iter().map(|(name, _)| name.clone()).collect();

        if nics.iter().any(|(_, loc)| loc.is_none()) {
            warn!("NIC placement data incomplete, using uniform NIC mapping");
            return Ok(Topology {
                gpu_to_nics: BTreeMap::new(),
                numa_to_nics: BTreeMap::new(),
                all_nics,
                discovered: false,
            });
        }

        let mut gpu_to_nics: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let mut numa_to_nics: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (name, loc) in &nics {
            let loc = loc.expect("checked above");
            if let Some(gpu) = loc.gpu {
                gpu_to_nics.entry(gpu).or_default().push(name.clone());
            }
            numa_to_nics.entry(loc.numa_node).or_default().push(name.clone());
        }

        debug!(
            nics = all_nics.len(),
            gpus = gpu_to_nics.len(),
            numa_nodes = numa_to_nics.len(),
            "topology discovered"
        );

        Ok(Topology { gpu_to_nics, numa_to_nics, all_nics, discovered: true })
    }

    /// Proximity-ordered NICs for a memory region.
    ///
    /// Device memory maps to the NICs grouped under the owning GPU;
    /// host memory to the NICs of the owning NUMA node. Undiscovered
    /// topologies and unknown NUMA nodes see every NIC; an unknown GPU
    /// sees none (the caller reports the capability gap).
    pub fn nics_for_memory(&self, region: &MemoryRegion) -> Vec<String> {
        if !self.discovered {
            return self.all_nics.clone();
        }
        match region.kind {
            MemoryKind::Device => {
                self.gpu_to_nics.get(&region.device_id).cloned().unwrap_or_default()
            }
            MemoryKind::Host => self
                .numa_to_nics
                .get(&region.device_id)
                .cloned()
                .unwrap_or_else(|| self.all_nics.clone()),
        }
    }

    /// Number of GPUs with at least one grouped NIC.
    pub fn num_gpus(&self) -> usize {
        self.gpu_to_nics.len()
    }

    /// Number of NUMA nodes with at least one NIC.
    pub fn num_numa(&self) -> usize {
        self.numa_to_nics.len()
    }

    /// Every NIC in discovery order.
    pub fn all_nics(&self) -> &[String] {
        &self.all_nics
    }

    /// False when discovery fell back to the uniform mapping.
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }
}
