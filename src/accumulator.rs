//! # Accumulator
//!
//! The only writer of new state. Ingestion comes in two shapes:
//!
//! - [`Accumulator::initialise`] installs a room's first state snapshot.
//! - [`Accumulator::accumulate`] applies a timeline chunk: inserts events,
//!   rolls the room's snapshot forward through each state event, and
//!   advances the room pointer.
//!
//! Each call runs in a single transaction covering every write for the
//! chunk; any error aborts it and leaves the room unchanged. Both operations
//! are idempotent on duplicate events within one call and across calls.
//!
//! ## Backfill Protection
//!
//! Upstream timelines are not always fresh: when a second user joins a room,
//! the upstream replays a window of history that can include events older
//! than what we have already applied (e.g. the invite that preceded a join we
//! ingested long ago). Applying those as if they were new corrupts state —
//! the invite would supersede the join in the snapshot. The rule: find the
//! last event in the chunk that already exists with a NID at or below the NID
//! the room's current snapshot was computed against; everything up to and
//! including it is backfill. Backfilled events are still stored (the log is
//! append-only and content-addressed) but they never touch the snapshot and
//! never appear in the live timeline.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::event_table::EventTable;
use crate::rooms_table::RoomsTable;
use crate::snapshot_table::SnapshotTable;
use crate::spaces_table::SpacesTable;
use crate::types::{
    AccumulateResult, Event, InitialiseResult, RoomInfo, SpaceRelation, EVENT_TYPE_MEMBER,
};

/// Orchestrates ingestion across the event, snapshot, rooms and spaces
/// tables.
pub struct Accumulator {
    pool: PgPool,
    pub events: EventTable,
    pub snapshots: SnapshotTable,
    pub rooms: RoomsTable,
    pub spaces: SpacesTable,
}

impl Accumulator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            events: EventTable,
            snapshots: SnapshotTable,
            rooms: RoomsTable,
            spaces: SpacesTable,
        }
    }

    /// Installs a room's first state.
    ///
    /// If the room already has a current snapshot this is a no-op, except
    /// that state event IDs the store has never seen are reported back so
    /// callers can prepend them to the next timeline chunk instead of losing
    /// them.
    ///
    /// Otherwise the events are inserted (membership strings `_`-prefixed to
    /// mark state-block origin), partitioned into membership vs. other, and
    /// written as one snapshot which becomes the room's current snapshot.
    /// Each event keeps `before_state_snapshot_id = 0`: initial state has no
    /// before-state.
    pub async fn initialise(&self, room_id: &str, state: &[Value]) -> Result<InitialiseResult> {
        if state.is_empty() {
            return Ok(InitialiseResult::default());
        }
        let mut txn = self.pool.begin().await?;

        let existing_snapshot_id = self.rooms.current_after_snapshot_id(&mut txn, room_id).await?;
        if existing_snapshot_id != 0 {
            let res = self
                .report_unknown_state_events(&mut txn, existing_snapshot_id, state)
                .await?;
            txn.commit().await?;
            return Ok(res);
        }

        let mut events = Vec::with_capacity(state.len());
        let mut seen = HashSet::with_capacity(state.len());
        for raw in state {
            let ev = Event::from_json(room_id, raw.clone(), true)?;
            if !seen.insert(ev.id.clone()) {
                warn!(room_id, event_id = %ev.id, "duplicate event in state block, skipping");
                continue;
            }
            events.push(ev);
        }

        let num_new = self.events.insert(&mut txn, &events).await?;
        if num_new == 0 {
            txn.commit().await?;
            return Ok(InitialiseResult::default());
        }
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let nid_by_id = self.events.select_nids_by_ids(&mut txn, &ids).await?;

        let mut membership_nids = Vec::new();
        let mut other_nids = Vec::new();
        let mut info = RoomInfo::new(room_id);
        let mut space_upserts = Vec::new();
        let mut space_deletes = Vec::new();
        for ev in &events {
            let nid = *nid_by_id.get(&ev.id).ok_or_else(|| {
                Error::Invariant(format!("inserted event {} has no NID", ev.id))
            })?;
            if ev.event_type == EVENT_TYPE_MEMBER {
                membership_nids.push(nid);
            } else {
                other_nids.push(nid);
            }
            info.apply_state_event(ev);
            if let Some((rel, asserted)) = SpaceRelation::from_event(ev) {
                if asserted {
                    space_upserts.push(rel);
                } else {
                    space_deletes.push(rel);
                }
            }
        }

        let snapshot_id = self
            .snapshots
            .insert(&mut txn, room_id, &membership_nids, &other_nids)
            .await?;
        // latest_nid stays 0: it tracks timeline ingestion, and initial
        // state is not timeline. State after any position in a room with no
        // timeline is simply the current snapshot.
        self.rooms.upsert(&mut txn, &info, snapshot_id, 0).await?;
        self.spaces.bulk_insert(&mut txn, &space_upserts).await?;
        self.spaces.bulk_delete(&mut txn, &space_deletes).await?;

        txn.commit().await?;
        Ok(InitialiseResult {
            added_events: true,
            snapshot_id,
            prepended_event_ids: Vec::new(),
        })
    }

    /// Applies a timeline chunk for one room, left to right.
    ///
    /// Returns how many rows were newly inserted and the NIDs of the events
    /// that count as live timeline (backfill excluded). `prev_batch` is
    /// attached to the first event of the chunk so
    /// `select_closest_prev_batch` can find it later.
    pub async fn accumulate(
        &self,
        room_id: &str,
        prev_batch: Option<&str>,
        timeline: &[Value],
    ) -> Result<AccumulateResult> {
        if timeline.is_empty() {
            return Ok(AccumulateResult::default());
        }
        let mut txn = self.pool.begin().await?;

        let mut events = Vec::with_capacity(timeline.len());
        let mut seen = HashSet::with_capacity(timeline.len());
        for raw in timeline {
            let ev = Event::from_json(room_id, raw.clone(), false)?;
            if !seen.insert(ev.id.clone()) {
                warn!(room_id, event_id = %ev.id, "duplicate event in timeline, skipping");
                continue;
            }
            events.push(ev);
        }
        if events.is_empty() {
            txn.commit().await?;
            return Ok(AccumulateResult::default());
        }
        if let Some(token) = prev_batch {
            events[0].prev_batch = Some(token.to_string());
        }

        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let known_before = self.events.select_nids_by_ids(&mut txn, &ids).await?;
        let num_new = self.events.insert(&mut txn, &events).await?;
        if num_new == 0 {
            txn.commit().await?;
            return Ok(AccumulateResult::default());
        }
        let nid_by_id = self.events.select_nids_by_ids(&mut txn, &ids).await?;
        for ev in &mut events {
            ev.nid = *nid_by_id.get(&ev.id).ok_or_else(|| {
                Error::Invariant(format!("inserted event {} has no NID", ev.id))
            })?;
        }

        // The NID the room's current snapshot was computed against. Any
        // already-known event at or below it proves the chunk prefix up to
        // that point is backfill.
        let room_key = room_id.to_string();
        let latest_nid = self
            .rooms
            .latest_nids(&mut txn, std::slice::from_ref(&room_key))
            .await?
            .get(room_id)
            .copied()
            .unwrap_or(0);
        let mut live_start = 0;
        for (i, ev) in events.iter().enumerate() {
            if known_before.contains_key(&ev.id) && ev.nid <= latest_nid {
                live_start = i + 1;
            }
        }
        if live_start > 0 {
            info!(
                room_id,
                dropped = live_start,
                "dropping backfilled timeline prefix"
            );
        }
        let live: Vec<&Event> = events[live_start..]
            .iter()
            .filter(|ev| !known_before.contains_key(&ev.id))
            .collect();
        if live.is_empty() {
            txn.commit().await?;
            return Ok(AccumulateResult {
                num_new,
                timeline_nids: Vec::new(),
            });
        }

        let mut snapshot_id = self.rooms.current_after_snapshot_id(&mut txn, room_id).await?;
        let (mut membership_nids, mut other_nids) = if snapshot_id != 0 {
            let row = self.snapshots.select(&mut txn, snapshot_id).await?;
            (row.membership_events, row.other_events)
        } else {
            (Vec::new(), Vec::new())
        };
        // (type, state_key) -> NID for the current snapshot, maintained as we
        // roll forward, so each state event finds what it replaces in O(1).
        let mut state_map: HashMap<(String, String), i64> = HashMap::new();
        let all_nids: Vec<i64> = membership_nids
            .iter()
            .chain(other_nids.iter())
            .copied()
            .collect();
        for stripped in self
            .events
            .select_stripped_events_by_nids(&mut txn, &all_nids)
            .await?
        {
            state_map.insert((stripped.event_type, stripped.state_key), stripped.nid);
        }

        let mut timeline_nids = Vec::with_capacity(live.len());
        let mut info = RoomInfo::new(room_id);
        let mut space_upserts = Vec::new();
        let mut space_deletes = Vec::new();
        for ev in &live {
            timeline_nids.push(ev.nid);
            if !ev.is_state_event() {
                self.events
                    .update_snapshot_linkage(&mut txn, ev.nid, snapshot_id, 0)
                    .await?;
                continue;
            }
            let key = (ev.event_type.clone(), ev.state_key.clone());
            let replaces_nid = match state_map.get(&key) {
                Some(&replaced) => {
                    let list = if ev.event_type == EVENT_TYPE_MEMBER {
                        &mut membership_nids
                    } else {
                        &mut other_nids
                    };
                    let slot = list.iter().position(|&n| n == replaced).ok_or_else(|| {
                        Error::Invariant(format!(
                            "snapshot {snapshot_id} state map references NID {replaced} not in its lists"
                        ))
                    })?;
                    list[slot] = ev.nid;
                    replaced
                }
                None => {
                    if ev.event_type == EVENT_TYPE_MEMBER {
                        membership_nids.push(ev.nid);
                    } else {
                        other_nids.push(ev.nid);
                    }
                    0
                }
            };
            self.events
                .update_snapshot_linkage(&mut txn, ev.nid, snapshot_id, replaces_nid)
                .await?;
            state_map.insert(key, ev.nid);
            snapshot_id = self
                .snapshots
                .insert(&mut txn, room_id, &membership_nids, &other_nids)
                .await?;
            info.apply_state_event(ev);
            if let Some((rel, asserted)) = SpaceRelation::from_event(ev) {
                if asserted {
                    space_upserts.push(rel);
                } else {
                    space_deletes.push(rel);
                }
            }
        }

        let last_live_nid = timeline_nids.last().copied().unwrap_or(0);
        self.rooms
            .upsert(&mut txn, &info, snapshot_id, last_live_nid)
            .await?;
        self.spaces.bulk_insert(&mut txn, &space_upserts).await?;
        self.spaces.bulk_delete(&mut txn, &space_deletes).await?;

        txn.commit().await?;
        Ok(AccumulateResult {
            num_new,
            timeline_nids,
        })
    }

    /// For an already-initialised room, works out which of the supplied
    /// state events the store has never seen.
    async fn report_unknown_state_events(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        snapshot_id: i64,
        state: &[Value],
    ) -> Result<InitialiseResult> {
        let mut ids = Vec::with_capacity(state.len());
        for raw in state {
            match raw.get("event_id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => ids.push(id.to_string()),
                _ => {
                    return Err(Error::BadEvent(
                        "event JSON missing event_id key".to_string(),
                    ))
                }
            }
        }
        let known: HashSet<String> = self
            .events
            .select_by_ids(txn, &ids)
            .await?
            .into_iter()
            .map(|ev| ev.id)
            .collect();
        let prepended: Vec<String> = ids
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        if !prepended.is_empty() {
            warn!(
                unknown = prepended.len(),
                "initialise called on known room with unseen state events"
            );
        }
        Ok(InitialiseResult {
            added_events: false,
            snapshot_id,
            prepended_event_ids: prepended,
        })
    }
}
