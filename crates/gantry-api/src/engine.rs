//! The backend engine contract.
//!
//! Every transport (fabric, shared memory, ...) implements
//! [`BackendEngine`]. The trait covers the full lifecycle: memory
//! registration, metadata publish/load, connection management, transfer
//! posting and polling, and the notification channel.

use crate::error::{Result, XferStatus};
use crate::mem::{MemoryKind, MemoryRegion, MetaDesc};

/// Direction of a one-sided transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum XferOp {
    /// Write local memory into the remote region.
    Write,
    /// Read the remote region into local memory.
    Read,
}

/// Optional per-transfer arguments.
///
/// Absent arguments (`None` at the call site) mean no notification is
/// requested.
#[derive(Debug, Clone, Default)]
pub struct XferArgs {
    /// Message to deliver to the target once every write of this
    /// transfer is visible there.
    pub notif_msg: Option<String>,
}

impl XferArgs {
    /// Request a completion notification carrying `msg`.
    pub fn with_notif(msg: impl Into<String>) -> Self {
        XferArgs { notif_msg: Some(msg.into()) }
    }

    /// True when a notification was requested.
    pub fn has_notif(&self) -> bool {
        self.notif_msg.is_some()
    }
}

/// A notification received from a remote agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Name of the sending agent.
    pub from: String,
    /// The message the sender attached.
    pub msg: String,
}

/// Contract implemented by every transfer backend.
///
/// Engines are used concurrently from multiple user threads; every
/// method takes `&self`. Handles returned by `register_mem`,
/// `load_remote_md` and `prep_xfer` are owned by the caller until given
/// back to the engine.
pub trait BackendEngine {
    /// Private metadata produced by registering local memory.
    type PrivateMd;
    /// Public metadata produced by loading a peer's (or one's own)
    /// serialized memory blob.
    type PublicMd;
    /// Handle tracking one user-level transfer between prep and release.
    type XferHandle;

    /// Whether this engine can target remote agents.
    fn supports_remote(&self) -> bool;
    /// Whether this engine can transfer between local regions.
    fn supports_local(&self) -> bool;
    /// Whether this engine carries a notification channel.
    fn supports_notif(&self) -> bool;
    /// The memory kinds this engine can register.
    fn supported_mems(&self) -> Vec<MemoryKind>;

    /// Register a local memory region, producing private metadata that
    /// owns the per-rail registrations.
    fn register_mem(&self, region: &MemoryRegion) -> Result<Self::PrivateMd>;

    /// Release the registrations owned by `md`. Continues past per-rail
    /// errors and reports the first.
    fn deregister_mem(&self, md: Self::PrivateMd) -> Result<()>;

    /// Serialize the public (peer-usable) form of a registration.
    fn get_public_data(&self, md: &Self::PrivateMd) -> Result<Vec<u8>>;

    /// Serialize this engine's endpoint info for publication to peers.
    fn get_conn_info(&self) -> Result<Vec<u8>>;

    /// Store a peer's published endpoint info, creating its connection
    /// record.
    fn load_remote_conn_info(&self, peer: &str, blob: &[u8]) -> Result<()>;

    /// Establish the connection to `peer`, blocking until it is
    /// connected or has failed.
    fn connect(&self, peer: &str) -> Result<()>;

    /// Tear down the connection to `peer`. The disconnect message to the
    /// peer is fire-and-forget.
    fn disconnect(&self, peer: &str) -> Result<()>;

    /// Deserialize a peer's public memory blob.
    fn load_remote_md(
        &self,
        blob: &[u8],
        kind: MemoryKind,
        peer: &str,
    ) -> Result<Self::PublicMd>;

    /// Produce public metadata over a local registration so local
    /// transfers use the same path as remote ones.
    fn load_local_md(&self, md: &Self::PrivateMd) -> Result<Self::PublicMd>;

    /// Drop loaded public metadata.
    fn unload_md(&self, md: Self::PublicMd) -> Result<()>;

    /// Validate descriptor lists and produce a transfer handle.
    ///
    /// `local` and `remote` must have equal length, and each pair of
    /// descriptors must agree on length.
    fn prep_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_, Self::PrivateMd>],
        remote: &[MetaDesc<'_, Self::PublicMd>],
        peer: &str,
        args: Option<&XferArgs>,
    ) -> Result<Self::XferHandle>;

    /// Post the transfer described at prep time. Returns `Completed`
    /// when every emitted operation already finished locally,
    /// `InProgress` otherwise.
    fn post_xfer(
        &self,
        op: XferOp,
        local: &[MetaDesc<'_, Self::PrivateMd>],
        remote: &[MetaDesc<'_, Self::PublicMd>],
        peer: &str,
        handle: &mut Self::XferHandle,
        args: Option<&XferArgs>,
    ) -> Result<XferStatus>;

    /// Poll a posted transfer. Never blocks.
    fn check_xfer(&self, handle: &mut Self::XferHandle) -> Result<XferStatus>;

    /// Give a transfer handle back to the engine. On an in-flight
    /// handle this is a hint; outstanding chunks remain valid until
    /// their completions fire.
    fn release_req(&self, handle: Self::XferHandle) -> Result<()>;

    /// Append pending notifications to `out`. Never blocks; returns
    /// `InProgress` when nothing was appended.
    fn get_notifs(&self, out: &mut Vec<Notification>) -> Result<XferStatus>;

    /// Send a standalone notification, not bound to any transfer.
    fn gen_notif(&self, peer: &str, msg: &str) -> Result<()>;
}
