#![warn(missing_docs)]

//! Gantry fabric plumbing: the multi-rail substrate the engine runs on.
//!
//! This crate provides the in-process reliable-datagram fabric
//! provider, NIC/GPU/NUMA topology discovery, per-NIC rails with their
//! request pools, the rail manager that stripes transfers and routes
//! control messages, and the wire formats crossing the bootstrap
//! channel.

pub mod manager;
pub mod pool;
pub mod rail;
pub mod serdes;
pub mod sim;
pub mod topology;
pub mod wire;

pub use manager::{RailManager, RailType, RegisteredMemory};
pub use pool::{
    CompletionFn, ControlPool, DataPool, OpKind, Request, CONTROL_BUFFER_SIZE,
    CONTROL_REQUESTS_PER_RAIL, DATA_REQUESTS_PER_RAIL,
};
pub use rail::{ProgressOutcome, Rail};
pub use serdes::{SerDes, SerDesError};
pub use sim::{
    AccessFlags, CompletionError, CompletionEvent, CompletionKind, CompletionQueue, Endpoint,
    FabricAddr, FabricDomain, FabricError, MrHandle, NicLocation,
};
pub use topology::Topology;
pub use wire::{
    pack_data_immediate, unpack_data_immediate, ControlTag, NotificationRecord, WireError,
    AGENT_NAME_LEN, MAX_XFER_IDS, MESSAGE_LEN, NOTIFICATION_RECORD_SIZE,
};
