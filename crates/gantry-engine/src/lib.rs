#![warn(missing_docs)]

//! Gantry fabric engines.
//!
//! [`FabricEngine`] is the concrete multi-rail backend: it registers
//! memory across topology-selected rails, stripes large transfers,
//! runs the connection state machine with its management thread, and
//! gates notification delivery on the visibility of every write the
//! notification describes. [`MultiFabricEngine`] fans an agent out
//! across one sub-engine per device.

pub mod connection;
pub mod engine;
pub mod handle;
pub mod multi;

pub use connection::{ConnAddrs, Connection, ConnectionState};
pub use engine::{FabricEngine, FabricPrivateMd, FabricPublicMd};
pub use handle::{FabricXferHandle, TransferProgress};
pub use multi::{MultiFabricEngine, MultiPrivateMd, MultiPublicMd, MultiXferHandle};
