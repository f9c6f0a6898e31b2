//! Memory model shared by all backend engines.

use serde::{Deserialize, Serialize};

/// Kind of memory a region lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Host (CPU) memory.
    Host,
    /// Device (GPU) memory.
    Device,
}

/// A contiguous memory region described by address, length, owning
/// device and kind.
///
/// For `Device` regions `device_id` is the GPU ordinal; for `Host`
/// regions it names the owning NUMA node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    /// Starting virtual address.
    pub addr: u64,
    /// Length in bytes.
    pub len: usize,
    /// Owning device ordinal (GPU id or NUMA node, by kind).
    pub device_id: u32,
    /// Memory kind.
    pub kind: MemoryKind,
}

impl MemoryRegion {
    /// Describe a host region on the given NUMA node.
    pub fn host(addr: u64, len: usize, numa_node: u32) -> Self {
        MemoryRegion { addr, len, device_id: numa_node, kind: MemoryKind::Host }
    }

    /// Describe a device region on the given GPU.
    pub fn device(addr: u64, len: usize, gpu_id: u32) -> Self {
        MemoryRegion { addr, len, device_id: gpu_id, kind: MemoryKind::Device }
    }

    /// Describe the memory backing a byte slice as host memory.
    pub fn of_slice(buf: &[u8], numa_node: u32) -> Self {
        MemoryRegion::host(buf.as_ptr() as u64, buf.len(), numa_node)
    }
}

/// A descriptor paired with the backend metadata needed to act on it.
///
/// Local descriptor lists carry private (registration) metadata; remote
/// lists carry public (key blob) metadata.
#[derive(Debug)]
pub struct MetaDesc<'a, M> {
    /// The region this descriptor covers.
    pub region: MemoryRegion,
    /// Backend metadata for the region.
    pub meta: &'a M,
}

impl<'a, M> MetaDesc<'a, M> {
    /// Couple a region with its backend metadata.
    pub fn new(region: MemoryRegion, meta: &'a M) -> Self {
        MetaDesc { region, meta }
    }
}

// Manual impls: derive would bound M, but the borrow is copyable regardless.
impl<M> Clone for MetaDesc<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for MetaDesc<'_, M> {}
