#![warn(missing_docs)]

//! Gantry backend contract: the operations every transfer backend
//! implements, plus the shared memory model, error taxonomy,
//! configuration, and telemetry plumbing.
//!
//! A backend engine lets an agent register local memory regions and
//! issue one-sided read/write transfers against registered regions of
//! remote agents, with a notification channel whose delivery is gated
//! on data visibility.

pub mod config;
pub mod engine;
pub mod error;
pub mod mem;
pub mod telemetry;

pub use config::{EngineConfig, ErrHandlingMode, InitParams};
pub use engine::{BackendEngine, Notification, XferArgs, XferOp};
pub use error::{BackendError, Result, XferStatus};
pub use mem::{MemoryKind, MemoryRegion, MetaDesc};
pub use telemetry::{TelemetryEvent, TelemetryQueue};
