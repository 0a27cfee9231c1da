//! # Domain Types
//!
//! This module defines the core types flowing through the store: events with
//! their server-assigned NIDs, state snapshots, cached room rows and the
//! result types of the two ingestion operations.
//!
//! ## Events Are Opaque JSON
//!
//! The upstream hands us events as raw JSON and we hand them back the same
//! way. The only fields the proxy ever reads are `event_id`, `type`,
//! `state_key`, `content.membership` and a handful of room-structure fields
//! (create/encryption/tombstone/space relations). Those are extracted once at
//! ingestion time and denormalized into columns; the stored JSON is never
//! modified.
//!
//! ## State-Block Membership Marking
//!
//! Membership events ingested from a room's *state block* (Initialise) store
//! their membership string with a `_` prefix (`_join`, `_invite`). This marks
//! state-block origin so member-listing queries can accept both forms while
//! timeline-derived rows keep the canonical string. The raw JSON is preserved
//! untouched either way.

use serde_json::Value;

use crate::error::{Error, Result};

/// Event type of membership events; partitions snapshots.
pub const EVENT_TYPE_MEMBER: &str = "m.room.member";
/// Room creation state event; carries room type and predecessor pointer.
pub const EVENT_TYPE_CREATE: &str = "m.room.create";
/// Enabling encryption latches the room's encrypted flag.
pub const EVENT_TYPE_ENCRYPTION: &str = "m.room.encryption";
/// Tombstone points at the replacement room after an upgrade.
pub const EVENT_TYPE_TOMBSTONE: &str = "m.room.tombstone";
/// Space child relation: state key is the child room id.
pub const EVENT_TYPE_SPACE_CHILD: &str = "m.space.child";
/// Space parent relation: state key is the parent room id.
pub const EVENT_TYPE_SPACE_PARENT: &str = "m.space.parent";
/// Explicit room name state event.
pub const EVENT_TYPE_NAME: &str = "m.room.name";
/// Canonical alias state event.
pub const EVENT_TYPE_CANONICAL_ALIAS: &str = "m.room.canonical_alias";

/// Room type value identifying spaces.
pub const ROOM_TYPE_SPACE: &str = "m.space";

/// Membership values we act on. Anything else (e.g. `knock`) is stored but
/// ignored by the visibility resolver.
pub const MEMBERSHIP_JOIN: &str = "join";
pub const MEMBERSHIP_INVITE: &str = "invite";
pub const MEMBERSHIP_LEAVE: &str = "leave";
pub const MEMBERSHIP_BAN: &str = "ban";

/// Prefix marking membership strings that came from a state block.
pub const STATE_BLOCK_MEMBERSHIP_PREFIX: &str = "_";

// =============================================================================
// Event
// =============================================================================

/// A stored (or about-to-be-stored) event row.
///
/// `nid` is zero until the row has been inserted and re-read;
/// `before_state_snapshot_id` is zero iff the event was part of the room's
/// first state; `replaces_nid` is zero unless this is a state event
/// superseding an earlier `(event_type, state_key)` pair in its
/// before-snapshot.
#[derive(Debug, Clone)]
pub struct Event {
    pub nid: i64,
    pub id: String,
    pub room_id: String,
    pub event_type: String,
    /// Empty for events without a `state_key` in their JSON. Protocol
    /// state-ness is judged by [`Event::is_state_event`], never by this field
    /// being empty (name events legitimately have an empty state key).
    pub state_key: String,
    /// Denormalized `content.membership`, possibly `_`-prefixed; empty for
    /// non-membership events.
    pub membership: String,
    pub before_state_snapshot_id: i64,
    pub replaces_nid: i64,
    /// Pagination token the upstream provided alongside the chunk whose first
    /// event this is.
    pub prev_batch: Option<String>,
    /// True iff the row was ingested from a state block rather than a
    /// timeline. State-block rows never render as timeline messages.
    pub is_state: bool,
    pub json: Value,
}

impl Event {
    /// Builds an event from an opaque JSON body, extracting the denormalized
    /// columns. `state_block` marks Initialise-supplied state events.
    ///
    /// # Errors
    ///
    /// `BadEvent` when the JSON is not an object or has no usable
    /// `event_id`.
    pub fn from_json(room_id: &str, json: Value, state_block: bool) -> Result<Self> {
        if !json.is_object() {
            return Err(Error::BadEvent("event JSON is not an object".to_string()));
        }
        let id = match json.get("event_id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(Error::BadEvent("event JSON missing event_id key".to_string())),
        };
        let event_type = json
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let state_key = json
            .get("state_key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let raw_membership = json
            .pointer("/content/membership")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let membership = if state_block && !raw_membership.is_empty() {
            format!("{STATE_BLOCK_MEMBERSHIP_PREFIX}{raw_membership}")
        } else {
            raw_membership.to_string()
        };
        Ok(Self {
            nid: 0,
            id,
            room_id: room_id.to_string(),
            event_type,
            state_key,
            membership,
            before_state_snapshot_id: 0,
            replaces_nid: 0,
            prev_batch: None,
            is_state: state_block,
            json,
        })
    }

    /// True iff the JSON body carries a `state_key`, i.e. this is a state
    /// event in the protocol sense.
    pub fn is_state_event(&self) -> bool {
        self.json.get("state_key").is_some()
    }

    /// The membership string with any state-block prefix stripped.
    pub fn canonical_membership(&self) -> &str {
        self.membership
            .strip_prefix(STATE_BLOCK_MEMBERSHIP_PREFIX)
            .unwrap_or(&self.membership)
    }

    /// `origin_server_ts` from the body, zero when absent.
    pub fn origin_server_ts(&self) -> u64 {
        self.json
            .get("origin_server_ts")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// A `(NID, event_type, state_key)` tuple: just enough of an event to roll a
/// snapshot forward without loading bodies.
#[derive(Debug, Clone)]
pub struct StrippedEvent {
    pub nid: i64,
    pub event_type: String,
    pub state_key: String,
}

// =============================================================================
// Snapshots and rooms
// =============================================================================

/// A write-once snapshot of a room's state: the NIDs of every current state
/// event, partitioned by membership vs. everything else.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub snapshot_id: i64,
    pub room_id: String,
    pub membership_events: Vec<i64>,
    pub other_events: Vec<i64>,
}

/// Cached per-room flags maintained by the accumulator.
///
/// The `Option` fields use "None = leave unchanged" upsert semantics so a
/// chunk that only bumps the snapshot pointer never clobbers flags set by an
/// earlier chunk.
#[derive(Debug, Clone, Default)]
pub struct RoomInfo {
    pub room_id: String,
    /// Latches: once true, stays true.
    pub is_encrypted: bool,
    pub upgraded_room_id: Option<String>,
    pub predecessor_room_id: Option<String>,
    pub room_type: Option<String>,
}

impl RoomInfo {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            ..Default::default()
        }
    }

    /// Folds the room-structure fields of a state event into this row.
    pub fn apply_state_event(&mut self, ev: &Event) {
        if !ev.state_key.is_empty() {
            return;
        }
        match ev.event_type.as_str() {
            EVENT_TYPE_CREATE => {
                if let Some(t) = ev.json.pointer("/content/type").and_then(Value::as_str) {
                    self.room_type = Some(t.to_string());
                }
                if let Some(p) = ev
                    .json
                    .pointer("/content/predecessor/room_id")
                    .and_then(Value::as_str)
                {
                    self.predecessor_room_id = Some(p.to_string());
                }
            }
            EVENT_TYPE_ENCRYPTION => {
                if ev.json.pointer("/content/algorithm").is_some() {
                    self.is_encrypted = true;
                }
            }
            EVENT_TYPE_TOMBSTONE => {
                if let Some(r) = ev
                    .json
                    .pointer("/content/replacement_room")
                    .and_then(Value::as_str)
                {
                    self.upgraded_room_id = Some(r.to_string());
                }
            }
            _ => {}
        }
    }
}

/// A single parent→child space relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceRelation {
    pub parent: String,
    pub child: String,
    /// One of [`EVENT_TYPE_SPACE_CHILD`] / [`EVENT_TYPE_SPACE_PARENT`].
    pub relation: String,
    /// Client-supplied lexicographic ordering hint, empty when unset.
    pub ordering: String,
}

impl SpaceRelation {
    /// Derives the relation encoded by an `m.space.child` / `m.space.parent`
    /// state event, along with whether it is an upsert or a deletion
    /// (relation events are deleted by writing content without `via`).
    ///
    /// Returns `None` for events that are not space relations.
    pub fn from_event(ev: &Event) -> Option<(Self, bool)> {
        let (parent, child) = match ev.event_type.as_str() {
            EVENT_TYPE_SPACE_CHILD => (ev.room_id.clone(), ev.state_key.clone()),
            EVENT_TYPE_SPACE_PARENT => (ev.state_key.clone(), ev.room_id.clone()),
            _ => return None,
        };
        if child.is_empty() || parent.is_empty() {
            return None;
        }
        let live = matches!(ev.json.pointer("/content/via"), Some(Value::Array(v)) if !v.is_empty());
        let ordering = ev
            .json
            .pointer("/content/order")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((
            Self {
                parent,
                child,
                relation: ev.event_type.clone(),
                ordering,
            },
            live,
        ))
    }
}

// =============================================================================
// Ingestion results
// =============================================================================

/// Result of [`crate::Accumulator::initialise`].
#[derive(Debug, Clone, Default)]
pub struct InitialiseResult {
    /// True iff this call installed the room's first state.
    pub added_events: bool,
    /// The room's current snapshot id after the call (pre-existing one when
    /// the call was a no-op).
    pub snapshot_id: i64,
    /// When the room was already initialised: state event IDs the store has
    /// never seen, in supplied order. Callers may prepend these to the next
    /// timeline chunk so they are not lost.
    pub prepended_event_ids: Vec<String>,
}

/// Result of [`crate::Accumulator::accumulate`].
#[derive(Debug, Clone, Default)]
pub struct AccumulateResult {
    /// Rows actually inserted (duplicates excluded).
    pub num_new: usize,
    /// NIDs of the events treated as live timeline, in order. Backfilled
    /// events are stored but do not appear here.
    pub timeline_nids: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_from_json_extracts_fields() {
        let ev = Event::from_json(
            "!r:s",
            json!({
                "event_id": "$e1",
                "type": "m.room.member",
                "state_key": "@alice:s",
                "content": {"membership": "join"},
                "origin_server_ts": 1234,
            }),
            false,
        )
        .unwrap();
        assert_eq!(ev.id, "$e1");
        assert_eq!(ev.room_id, "!r:s");
        assert_eq!(ev.event_type, "m.room.member");
        assert_eq!(ev.state_key, "@alice:s");
        assert_eq!(ev.membership, "join");
        assert!(!ev.is_state);
        assert!(ev.is_state_event());
        assert_eq!(ev.origin_server_ts(), 1234);
    }

    #[test]
    fn test_event_missing_event_id_is_rejected() {
        let err = Event::from_json("!r:s", json!({"type": "m.room.message"}), false).unwrap_err();
        assert!(matches!(err, Error::BadEvent(_)));
        let err = Event::from_json("!r:s", json!([1, 2]), false).unwrap_err();
        assert!(matches!(err, Error::BadEvent(_)));
    }

    #[test]
    fn test_state_block_membership_is_prefixed_in_column_only() {
        let ev = Event::from_json(
            "!r:s",
            json!({
                "event_id": "$e2",
                "type": "m.room.member",
                "state_key": "@bob:s",
                "content": {"membership": "join"},
            }),
            true,
        )
        .unwrap();
        assert_eq!(ev.membership, "_join");
        assert_eq!(ev.canonical_membership(), "join");
        assert!(ev.is_state);
        // stored JSON keeps the raw string
        assert_eq!(ev.json.pointer("/content/membership").unwrap(), "join");
    }

    #[test]
    fn test_message_event_is_not_state() {
        let ev = Event::from_json(
            "!r:s",
            json!({"event_id": "$m", "type": "m.room.message", "content": {"body": "hi"}}),
            false,
        )
        .unwrap();
        assert!(!ev.is_state_event());
        assert_eq!(ev.state_key, "");
        assert_eq!(ev.membership, "");
    }

    #[test]
    fn test_room_info_flags() {
        let mut info = RoomInfo::new("!r:s");
        let create = Event::from_json(
            "!r:s",
            json!({
                "event_id": "$c",
                "type": "m.room.create",
                "state_key": "",
                "content": {"type": "m.space", "predecessor": {"room_id": "!old:s"}},
            }),
            true,
        )
        .unwrap();
        info.apply_state_event(&create);
        assert_eq!(info.room_type.as_deref(), Some("m.space"));
        assert_eq!(info.predecessor_room_id.as_deref(), Some("!old:s"));

        let enc = Event::from_json(
            "!r:s",
            json!({
                "event_id": "$enc",
                "type": "m.room.encryption",
                "state_key": "",
                "content": {"algorithm": "m.megolm.v1.aes-sha2"},
            }),
            false,
        )
        .unwrap();
        info.apply_state_event(&enc);
        assert!(info.is_encrypted);

        let tomb = Event::from_json(
            "!r:s",
            json!({
                "event_id": "$t",
                "type": "m.room.tombstone",
                "state_key": "",
                "content": {"replacement_room": "!new:s"},
            }),
            false,
        )
        .unwrap();
        info.apply_state_event(&tomb);
        assert_eq!(info.upgraded_room_id.as_deref(), Some("!new:s"));
    }

    #[test]
    fn test_space_relation_from_event() {
        let child = Event::from_json(
            "!space:s",
            json!({
                "event_id": "$sc",
                "type": "m.space.child",
                "state_key": "!room:s",
                "content": {"via": ["s"], "order": "aaa"},
            }),
            false,
        )
        .unwrap();
        let (rel, live) = SpaceRelation::from_event(&child).unwrap();
        assert!(live);
        assert_eq!(rel.parent, "!space:s");
        assert_eq!(rel.child, "!room:s");
        assert_eq!(rel.ordering, "aaa");

        // empty content means the relation was deleted
        let gone = Event::from_json(
            "!space:s",
            json!({"event_id": "$sc2", "type": "m.space.child", "state_key": "!room:s", "content": {}}),
            false,
        )
        .unwrap();
        let (_, live) = SpaceRelation::from_event(&gone).unwrap();
        assert!(!live);

        // parent relation is inverted
        let parent = Event::from_json(
            "!room:s",
            json!({"event_id": "$sp", "type": "m.space.parent", "state_key": "!space:s", "content": {"via": ["s"]}}),
            false,
        )
        .unwrap();
        let (rel, live) = SpaceRelation::from_event(&parent).unwrap();
        assert!(live);
        assert_eq!(rel.parent, "!space:s");
        assert_eq!(rel.child, "!room:s");
    }
}
