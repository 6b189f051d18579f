//! # sqlroom-collab: replicated room documents with debounced persistence
//!
//! ```text
//!   apply_update(room, bytes)
//!          │
//!          ▼
//! ┌──────────────────┐   get/create   ┌──────────────┐
//! │ RoomStateManager │ ─────────────► │ Room         │
//! └──────────────────┘                │  Yrs Doc     │
//!                                     │  room lock   │
//!                                     │  write-back ─┼──► SnapshotStore
//!                                     └──────────────┘     (meta table)
//! ```
//!
//! ## Modules
//!
//! - [`manager`]: room table, lazy load, flush, client snapshot guard
//! - [`room`]: one document with its lock and dirty tracking
//! - [`writeback`]: reusable coalescing timer
//! - [`store`]: snapshot persistence backends

pub mod error;
pub mod manager;
pub mod room;
pub mod store;
pub mod writeback;

pub use error::RoomError;
pub use manager::{empty_snapshot_len, RoomConfig, RoomStateManager};
pub use room::{LoadPhase, Room};
pub use store::{MemorySnapshotStore, SnapshotStore, SqlSnapshotStore, StoreError};
pub use writeback::{CoalescingWriteBack, FlushFn};
