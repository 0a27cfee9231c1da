//! # Postgres Schema
//!
//! This module defines the relational layout and handles initialization. The
//! layout is load-bearing: deployments can swap proxy implementations without
//! re-ingesting, so column names and types must stay exactly as below.
//!
//! ## Table Overview
//!
//! ```text
//! syncv3_events                    syncv3_snapshots
//! ┌──────────────────────────┐     ┌────────────────────────┐
//! │ event_nid (PK, seq)      │◄────│ membership_events []   │
//! │ event_id  (UNIQUE)       │     │ events []              │
//! │ room_id                  │     │ snapshot_id (PK, seq)  │
//! │ before_state_snapshot_id ├────►│ room_id                │
//! │ replaces_nid             │     └───────────▲────────────┘
//! │ prev_batch / is_state    │                 │ current_snapshot_id
//! │ event JSONB              │     ┌───────────┴────────────┐
//! └──────────────────────────┘     │ syncv3_rooms           │
//!                                  │ room_id (PK)           │
//! syncv3_spaces                    │ latest_nid             │
//! ┌──────────────────────────┐     │ is_encrypted / type    │
//! │ parent/child/relation    │     │ predecessor / upgraded │
//! └──────────────────────────┘     └────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why NID lists instead of a state table?
//!
//! Snapshots are values: an immutable `BIGINT[]` pair referenced by id. Writes
//! stay append-only apart from the single room-pointer update, point-in-time
//! reads are one array fetch, and there is no room → state → event pointer
//! graph to keep acyclic.
//!
//! ### Why two sequences?
//!
//! Event NIDs form the global total order clients paginate by; snapshot ids
//! only need to be unique and monotonic per room. Separate sequences keep
//! both dense.

use sqlx::PgPool;

use crate::error::Result;

/// Sequence backing `event_nid`: the single global total order.
const CREATE_EVENT_NID_SEQ: &str = "CREATE SEQUENCE IF NOT EXISTS syncv3_event_nids_seq";

/// Sequence backing `snapshot_id`.
const CREATE_SNAPSHOT_SEQ: &str = "CREATE SEQUENCE IF NOT EXISTS syncv3_snapshots_seq";

/// The event table: one row per event ever seen, keyed by the opaque
/// `event_id` for content addressing and by `event_nid` for ordering.
///
/// - `before_state_snapshot_id`: room state immediately before this event;
///   0 iff the event was part of the room's first state
/// - `replaces_nid`: for state events, the NID superseded within the
///   before-snapshot, or 0 when the event adds a new `(type, state_key)`
/// - `prev_batch`: upstream pagination token of the chunk this event headed
/// - `is_state`: row came from a state block, never rendered as timeline
const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS syncv3_events (
    event_nid BIGINT PRIMARY KEY NOT NULL DEFAULT nextval('syncv3_event_nids_seq'),
    event_id TEXT NOT NULL UNIQUE,
    room_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    state_key TEXT NOT NULL DEFAULT '',
    membership TEXT,
    before_state_snapshot_id BIGINT NOT NULL DEFAULT 0,
    replaces_nid BIGINT NOT NULL DEFAULT 0,
    prev_batch TEXT,
    is_state BOOLEAN NOT NULL DEFAULT FALSE,
    event JSONB NOT NULL
)
"#;

/// Timeline reads are always `room_id` + NID range scans.
const CREATE_EVENTS_ROOM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS syncv3_events_room_nid ON syncv3_events(room_id, event_nid)
"#;

/// Membership replay scans by `(event_type, state_key)` across all rooms.
const CREATE_EVENTS_TYPE_SKEY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS syncv3_events_type_skey ON syncv3_events(event_type, state_key, event_nid)
"#;

/// Snapshots: write-once named sets of state-event NIDs. `events` holds the
/// non-membership NIDs (the deployed column name), `membership_events` the
/// member ones.
const CREATE_SNAPSHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS syncv3_snapshots (
    snapshot_id BIGINT PRIMARY KEY NOT NULL DEFAULT nextval('syncv3_snapshots_seq'),
    room_id TEXT NOT NULL,
    events BIGINT[] NOT NULL,
    membership_events BIGINT[] NOT NULL
)
"#;

/// Rooms: the one mutable pointer per room plus cached flags. `latest_nid`
/// is the NID the current snapshot was computed against; readers use it to
/// detect when the database has raced ahead of their position.
const CREATE_ROOMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS syncv3_rooms (
    room_id TEXT NOT NULL PRIMARY KEY,
    current_snapshot_id BIGINT NOT NULL,
    latest_nid BIGINT NOT NULL DEFAULT 0,
    is_encrypted BOOL NOT NULL DEFAULT FALSE,
    type TEXT,
    predecessor_room_id TEXT,
    upgraded_room_id TEXT
)
"#;

/// Space relations, one row per `(parent, child, relation)`.
const CREATE_SPACES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS syncv3_spaces (
    parent_room_id TEXT NOT NULL,
    child_room_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    ordering TEXT NOT NULL DEFAULT '',
    UNIQUE(parent_room_id, child_room_id, relation)
)
"#;

/// Creates all sequences, tables and indexes. Idempotent, so safe to call on
/// every startup; concurrent writers are expected to have run this before
/// ingesting.
pub async fn create_tables(pool: &PgPool) -> Result<()> {
    for ddl in [
        CREATE_EVENT_NID_SEQ,
        CREATE_SNAPSHOT_SEQ,
        CREATE_EVENTS_TABLE,
        CREATE_EVENTS_ROOM_INDEX,
        CREATE_EVENTS_TYPE_SKEY_INDEX,
        CREATE_SNAPSHOTS_TABLE,
        CREATE_ROOMS_TABLE,
        CREATE_SPACES_TABLE,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
