//! # sashsync - Windowed Sync Proxy Core
//!
//! sashsync sits between many client devices and an upstream chat server
//! exposing a full-sync API, and reshapes that long-form stream into a
//! windowed, incremental, list-oriented sync: clients describe one or more
//! sliding windows over their room list (ranges, sort order, filter,
//! per-room subscriptions) and receive only the deltas relevant to those
//! windows plus the requested per-room state and timeline slice.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Upstream full-sync client                    │
//! │                      (out of scope, writes in)                   │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ Initialise / Accumulate
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Accumulator                              │
//! │        (single transaction per chunk, the only writer)           │
//! │                                                                  │
//! │   ┌────────┐  ┌───────────┐  ┌────────┐  ┌────────┐             │
//! │   │ events │  │ snapshots │  │ rooms  │  │ spaces │             │
//! │   └────────┘  └───────────┘  └────────┘  └────────┘             │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Storage Facade                             │
//! │   global snapshot · state-after-position · visibility intervals  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Request Engine                             │
//! │     request diff · list materialization · DELETE/INSERT ops      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These invariants are enforced throughout the codebase and must never be
//! violated:
//!
//! 1. **Content addressing**: an `event_id` identifies exactly one row;
//!    duplicate inserts are no-ops and never allocate a new NID
//! 2. **Total order**: NIDs come from a single monotonic sequence and are
//!    strictly increasing within a room in ingestion order
//! 3. **Immutable snapshots**: a snapshot row is write-once; the room
//!    pointer is the only thing that moves
//! 4. **Atomic ingestion**: all writes for one upstream chunk happen in one
//!    transaction; partial success is not observable
//! 5. **Latched encryption**: a room's encryption flag never returns to
//!    false
//!
//! ## Module Organization
//!
//! - [`error`]: Custom error types for all failure modes
//! - [`schema`]: Postgres DDL and database initialization
//! - [`types`]: Domain types (Event, SnapshotRow, RoomInfo, ...)
//! - [`sqlutil`]: Parameter-cap chunking for bulk statements
//! - [`event_table`]: Content-addressed event store, NID assignment
//! - [`snapshot_table`]: Write-once NID-list snapshots
//! - [`rooms_table`]: Per-room snapshot pointer and cached flags
//! - [`spaces_table`]: Parent→child space relation index
//! - [`accumulator`]: Initialise / Accumulate ingestion
//! - [`storage`]: Transaction-boundary read facade + visibility resolver
//! - [`metadata`]: Room metadata, heroes, display names, required-state maps
//! - [`ranges`]: Sliding-window index ranges
//! - [`request`]: Client request model, diffing and move-op policy
//! - [`lists`]: Sorted/filtered room lists and the per-connection engine

pub mod accumulator;
pub mod error;
pub mod event_table;
pub mod lists;
pub mod metadata;
pub mod ranges;
pub mod request;
pub mod rooms_table;
pub mod schema;
pub mod snapshot_table;
pub mod spaces_table;
pub mod sqlutil;
pub mod storage;
pub mod types;

pub use accumulator::Accumulator;
pub use error::{Error, Result};
pub use event_table::EventTable;
pub use lists::{build_space_descendants, RequestEngine, RoomListEntry, SortableRooms, SpaceDescendants};
pub use metadata::{calculate_room_name, RequiredStateMap, RoomMetadata};
pub use ranges::SliceRanges;
pub use request::{Request, RequestDelta, RequestFilters, RequestList, ResponseOp, RoomSubscription};
pub use rooms_table::RoomsTable;
pub use snapshot_table::SnapshotTable;
pub use spaces_table::SpacesTable;
pub use storage::{StartupSnapshot, Storage};
pub use types::{AccumulateResult, Event, InitialiseResult, RoomInfo, SnapshotRow};
