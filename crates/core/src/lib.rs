//! `tubesync-core`: shared primitives for the sync subsystem.
//!
//! This crate contains **pure** building blocks (no I/O): identifiers, the
//! injected clock, and the error model.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SyncError, SyncResult};
pub use id::{ItemId, SourceId, SourceKind};
