//! # Storage Facade
//!
//! The transaction boundary. Every read that touches more than one table
//! runs inside a single transaction for a consistent view; writes delegate
//! to the [`Accumulator`], whose transactions cover whole upstream chunks.
//!
//! Read-committed isolation is sufficient throughout: snapshots are
//! write-once and referenced by id, and the room pointer is updated last, so
//! a reader sees either the old snapshot or the new one atomically.
//!
//! ## The Fast/Slow State Read
//!
//! The in-memory dispatcher that drives user sessions lags the database by
//! design (commit precedes dispatch), so a client's position can briefly be
//! behind a room's latest NID. [`Storage::room_state_after_event_position`]
//! trusts the room-pointer cache when it is at or behind the position (fast
//! path) and reconstructs the exact state at the position from the event
//! log when the database has raced ahead (slow path). Slow-path occurrences
//! are logged: frequent ones mean the caller is handing out stale positions.

use std::collections::HashMap;

use futures::TryStreamExt;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;

use crate::accumulator::Accumulator;
use crate::error::{Error, Result};
use crate::event_table::{event_from_row, EVENT_COLS};
use crate::metadata::{EventMetadata, Hero, RoomMetadata};
use crate::schema;
use crate::types::{
    AccumulateResult, Event, InitialiseResult, EVENT_TYPE_CANONICAL_ALIAS, EVENT_TYPE_MEMBER,
    EVENT_TYPE_NAME, EVENT_TYPE_SPACE_CHILD, MEMBERSHIP_BAN, MEMBERSHIP_INVITE, MEMBERSHIP_JOIN,
    MEMBERSHIP_LEAVE,
};

/// Connection pool size. Readers are long-poll driven and bursty; writers
/// are one per upstream connection.
const MAX_POOL_CONNECTIONS: u32 = 10;

/// Transaction-scoped relation created by [`Storage::prepare_snapshot`].
const TEMP_SNAPSHOT_TABLE: &str = "temp_snapshot";

/// How many heroes the global snapshot keeps per room: six, so a display
/// name can always draw on five no matter who is asking.
const NUM_HEROES: i64 = 6;

/// Everything a sliding-sync instance needs to boot: per-room metadata and
/// the joined-member lists, captured atomically.
#[derive(Debug, Clone, Default)]
pub struct StartupSnapshot {
    /// room_id → metadata.
    pub global_metadata: HashMap<String, RoomMetadata>,
    /// room_id → joined user IDs, ordered by join NID ascending.
    pub all_joined_members: HashMap<String, Vec<String>>,
}

/// The facade composing the tables for reads and the accumulator for
/// writes.
pub struct Storage {
    pool: PgPool,
    pub accumulator: Accumulator,
}

impl Storage {
    /// Connects to Postgres and creates the schema if necessary.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool (shared with other components or tests).
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        schema::create_tables(&pool).await?;
        Ok(Self {
            accumulator: Accumulator::new(pool.clone()),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Closes the pool. Outstanding transactions are rolled back by the
    /// server.
    pub async fn teardown(self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Ingestion (delegated)
    // =========================================================================

    pub async fn initialise(&self, room_id: &str, state: &[Value]) -> Result<InitialiseResult> {
        self.accumulator.initialise(room_id, state).await
    }

    pub async fn accumulate(
        &self,
        room_id: &str,
        prev_batch: Option<&str>,
        timeline: &[Value],
    ) -> Result<AccumulateResult> {
        self.accumulator.accumulate(room_id, prev_batch, timeline).await
    }

    // =========================================================================
    // Simple reads
    // =========================================================================

    /// The highest NID ever issued, zero when the store is empty.
    pub async fn latest_event_nid(&self) -> Result<i64> {
        let mut txn = self.pool.begin().await?;
        let nid = self.accumulator.events.select_highest_nid(&mut txn).await?;
        txn.commit().await?;
        Ok(nid)
    }

    /// The JSON bodies for the given NIDs, NID ascending.
    pub async fn event_nids(&self, nids: &[i64]) -> Result<Vec<Value>> {
        let mut txn = self.pool.begin().await?;
        let events = self.accumulator.events.select_by_nids(&mut txn, nids).await?;
        txn.commit().await?;
        Ok(events.into_iter().map(|e| e.json).collect())
    }

    /// The full state a snapshot names, as JSON bodies.
    pub async fn state_snapshot(&self, snapshot_id: i64) -> Result<Vec<Value>> {
        let mut txn = self.pool.begin().await?;
        let snap = self.accumulator.snapshots.select(&mut txn, snapshot_id).await?;
        let mut nids = snap.membership_events;
        nids.extend(snap.other_events);
        let events = self.accumulator.events.select_by_nids(&mut txn, &nids).await?;
        txn.commit().await?;
        Ok(events.into_iter().map(|e| e.json).collect())
    }

    // =========================================================================
    // Global snapshot
    // =========================================================================

    /// Materializes the union of membership NIDs from every room's current
    /// snapshot into a transaction-local temporary relation.
    ///
    /// This is a query-planner hint: nested as a subselect, the downstream
    /// metadata queries degrade into one btree lookup per NID over a large
    /// fraction of the event table; against a materialized relation they
    /// scan. The relation is dropped on commit.
    pub async fn prepare_snapshot(
        &self,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<&'static str> {
        sqlx::query(&format!(
            "CREATE TEMP TABLE {TEMP_SNAPSHOT_TABLE} ON COMMIT DROP AS \
             SELECT UNNEST(membership_events) AS membership_nid \
             FROM syncv3_snapshots \
             JOIN syncv3_rooms ON syncv3_snapshots.snapshot_id = syncv3_rooms.current_snapshot_id"
        ))
        .execute(&mut **txn)
        .await?;
        Ok(TEMP_SNAPSHOT_TABLE)
    }

    /// Snapshots the entire database for initialising a sliding-sync
    /// instance: metadata for all rooms and all joined members, grabbed
    /// atomically in one transaction.
    pub async fn global_snapshot(&self) -> Result<StartupSnapshot> {
        let mut txn = self.pool.begin().await?;
        let temp_table = self.prepare_snapshot(&mut txn).await?;
        let (all_joined_members, mut metadata) =
            self.all_joined_members(&mut txn, temp_table).await?;
        self.metadata_for_all_rooms(&mut txn, temp_table, &mut metadata)
            .await?;
        txn.commit().await?;
        Ok(StartupSnapshot {
            global_metadata: metadata,
            all_joined_members,
        })
    }

    /// All rooms with joined members in their current snapshot, with the
    /// joined user list ordered by join NID ascending. Requires a prepared
    /// snapshot.
    async fn all_joined_members(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        temp_table: &str,
    ) -> Result<(HashMap<String, Vec<String>>, HashMap<String, RoomMetadata>)> {
        let mut joined: HashMap<String, Vec<String>> = HashMap::new();
        {
            let query_str = format!(
                "SELECT room_id, state_key FROM {temp_table} \
                 INNER JOIN syncv3_events ON membership_nid = event_nid \
                 WHERE membership = 'join' OR membership = '_join' \
                 ORDER BY event_nid ASC"
            );
            let mut rows = sqlx::query(&query_str)
            .fetch(&mut **txn);
            while let Some(row) = rows.try_next().await? {
                let room_id: String = row.try_get("room_id")?;
                let user_id: String = row.try_get("state_key")?;
                joined.entry(room_id).or_default().push(user_id);
            }
        }
        let mut metadata = HashMap::with_capacity(joined.len());
        for (room_id, members) in &joined {
            let mut m = RoomMetadata::new(room_id);
            m.join_count = members.len();
            metadata.insert(room_id.clone(), m);
        }
        Ok((joined, metadata))
    }

    /// Fills invite counts, activity timestamps, name/alias, heroes, room
    /// flags and space children into `result`. Requires a prepared snapshot.
    async fn metadata_for_all_rooms(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        temp_table: &str,
        result: &mut HashMap<String, RoomMetadata>,
    ) -> Result<()> {
        // invite counts from current-snapshot memberships
        let rows = sqlx::query(&format!(
            "SELECT room_id, count(state_key) AS invite_count FROM syncv3_events \
             INNER JOIN {temp_table} ON membership_nid = event_nid \
             WHERE (membership = 'invite' OR membership = '_invite') \
               AND event_type = 'm.room.member' \
             GROUP BY room_id"
        ))
        .fetch_all(&mut **txn)
        .await?;
        for row in &rows {
            let room_id: String = row.try_get("room_id")?;
            let invite_count: i64 = row.try_get("invite_count")?;
            result
                .entry(room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&room_id))
                .invite_count = invite_count as usize;
        }

        // last activity and latest-event-by-type. A room can appear here
        // without appearing in the joined scan (e.g. invite-only so far), so
        // entries are created on demand.
        let latest = self
            .accumulator
            .events
            .select_latest_event_by_type_in_all_rooms(txn)
            .await?;
        for ev in &latest {
            let ts = ev.origin_server_ts();
            let metadata = result
                .entry(ev.room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&ev.room_id));
            metadata.last_message_timestamp = metadata.last_message_timestamp.max(ts);
            metadata
                .latest_events_by_type
                .insert(ev.event_type.clone(), EventMetadata { nid: ev.nid, timestamp: ts });
        }

        // name and canonical alias from current non-membership state
        let named = self
            .current_non_membership_state_events_in_all_rooms(
                txn,
                &[EVENT_TYPE_NAME.to_string(), EVENT_TYPE_CANONICAL_ALIAS.to_string()],
            )
            .await?;
        for (room_id, events) in named {
            let metadata = result
                .entry(room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&room_id));
            for ev in events {
                if ev.event_type == EVENT_TYPE_NAME && ev.state_key.is_empty() {
                    metadata.name_event = ev
                        .json
                        .pointer("/content/name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                } else if ev.event_type == EVENT_TYPE_CANONICAL_ALIAS && ev.state_key.is_empty() {
                    metadata.canonical_alias = ev
                        .json
                        .pointer("/content/alias")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                }
            }
        }

        // The most recent members of each room serve as heroes. The upstream
        // spec is ambiguous between forward and backward stream order; we
        // take the most recent NUM_HEROES, newest first, deduplicated by
        // target user.
        let rows = sqlx::query(&format!(
            "SELECT rf.room_id, rf.event FROM ( \
               SELECT room_id, event, event_nid, rank() OVER ( \
                 PARTITION BY room_id ORDER BY event_nid DESC \
               ) AS rnk FROM syncv3_events \
               INNER JOIN {temp_table} ON membership_nid = event_nid \
               WHERE (membership = 'join' OR membership = '_join' \
                   OR membership = 'invite' OR membership = '_invite') \
                 AND event_type = 'm.room.member' \
             ) rf WHERE rf.rnk <= $1 ORDER BY rf.room_id, rf.event_nid DESC"
        ))
        .bind(NUM_HEROES)
        .fetch_all(&mut **txn)
        .await?;
        let mut seen: HashMap<String, ()> = HashMap::new();
        for row in &rows {
            let room_id: String = row.try_get("room_id")?;
            let body: Value = row.try_get("event")?;
            let target = body
                .get("state_key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if seen.insert(format!("{room_id} {target}"), ()).is_some() {
                continue;
            }
            let display_name = body
                .pointer("/content/displayname")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            result
                .entry(room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&room_id))
                .heroes
                .push(Hero {
                    user_id: target,
                    display_name,
                });
        }

        // cached room flags, and which rooms are spaces
        let infos = self.accumulator.rooms.select_room_infos(txn).await?;
        let mut space_room_ids = Vec::new();
        for info in infos {
            let metadata = result
                .entry(info.room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&info.room_id));
            metadata.encrypted = info.is_encrypted;
            metadata.upgraded_room_id = info.upgraded_room_id;
            metadata.predecessor_room_id = info.predecessor_room_id;
            metadata.room_type = info.room_type;
            if metadata.is_space() {
                space_room_ids.push(info.room_id);
            }
        }

        // space children: only child assertions count, parent back-pointers
        // are stored but not navigated here
        let children = self
            .accumulator
            .spaces
            .select_children(txn, &space_room_ids)
            .await?;
        for (room_id, relations) in children {
            let metadata = result
                .entry(room_id.clone())
                .or_insert_with(|| RoomMetadata::new(&room_id));
            for rel in relations {
                if rel.relation == EVENT_TYPE_SPACE_CHILD {
                    metadata.child_space_rooms.insert(rel.child);
                }
            }
        }
        Ok(())
    }

    /// Current non-membership state events of the given types, across all
    /// rooms, grouped by room.
    async fn current_non_membership_state_events_in_all_rooms(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        event_types: &[String],
    ) -> Result<HashMap<String, Vec<Event>>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events \
             WHERE event_type = ANY($1) AND event_nid IN ( \
               SELECT unnest(events) FROM syncv3_snapshots \
               WHERE snapshot_id IN (SELECT current_snapshot_id FROM syncv3_rooms) \
             )"
        ))
        .bind(event_types)
        .fetch_all(&mut **txn)
        .await?;
        let mut out: HashMap<String, Vec<Event>> = HashMap::new();
        for row in &rows {
            let ev = event_from_row(row)?;
            out.entry(ev.room_id.clone()).or_default().push(ev);
        }
        Ok(out)
    }

    // =========================================================================
    // State after position
    // =========================================================================

    /// The state events a client should see in each room as of stream
    /// position `pos`, optionally narrowed by an `event_type → state_keys`
    /// filter (empty key list = every key of that type; empty map = all
    /// state).
    pub async fn room_state_after_event_position(
        &self,
        room_ids: &[String],
        pos: i64,
        filter: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<Event>>> {
        let mut txn = self.pool.begin().await?;
        let mut result: HashMap<String, Vec<Event>> = HashMap::with_capacity(room_ids.len());

        let latest_nids = self.accumulator.rooms.latest_nids(&mut txn, room_ids).await?;
        let mut fast_nids = Vec::with_capacity(latest_nids.len());
        let mut snapshot_only_rooms = Vec::new();
        let mut slow_rooms = Vec::new();
        for (room_id, latest_nid) in &latest_nids {
            if *latest_nid > pos {
                slow_rooms.push(room_id.clone());
            } else if *latest_nid == 0 {
                // room has state but no timeline yet: state after any
                // position is the current snapshot
                snapshot_only_rooms.push(room_id.clone());
            } else {
                fast_nids.push(*latest_nid);
            }
        }

        let mut latest_events = self.accumulator.events.select_by_nids(&mut txn, &fast_nids).await?;
        if !slow_rooms.is_empty() {
            warn!(
                slow_rooms = slow_rooms.len(),
                pos, "position behind the database copy, using slow state reads"
            );
            let slow_events = self
                .accumulator
                .events
                .latest_event_in_rooms(&mut txn, &slow_rooms, pos)
                .await?;
            latest_events.extend(slow_events);
        }
        for room_id in snapshot_only_rooms {
            let snapshot_id = self
                .accumulator
                .rooms
                .current_after_snapshot_id(&mut txn, &room_id)
                .await?;
            latest_events.push(Event {
                nid: 0,
                id: String::new(),
                room_id,
                event_type: String::new(),
                state_key: String::new(),
                membership: String::new(),
                before_state_snapshot_id: snapshot_id,
                replaces_nid: 0,
                prev_batch: None,
                is_state: false,
                json: Value::Null,
            });
        }
        for ev in &mut latest_events {
            if ev.before_state_snapshot_id == 0 {
                // the latest event is part of the initial state, so state
                // after it equals the current snapshot
                ev.before_state_snapshot_id = self
                    .accumulator
                    .rooms
                    .current_after_snapshot_id(&mut txn, &ev.room_id)
                    .await?;
            }
        }

        if filter.is_empty() {
            for ev in &latest_events {
                let snap = self
                    .accumulator
                    .snapshots
                    .select(&mut txn, ev.before_state_snapshot_id)
                    .await?;
                let mut all_nids = snap.membership_events;
                all_nids.extend(snap.other_events);
                if ev.is_state_event() {
                    if ev.replaces_nid != 0 {
                        let slot = all_nids
                            .iter()
                            .position(|&n| n == ev.replaces_nid)
                            .ok_or_else(|| {
                                Error::Invariant(format!(
                                    "event {} replaces NID {} which is not in snapshot {}",
                                    ev.id, ev.replaces_nid, ev.before_state_snapshot_id
                                ))
                            })?;
                        all_nids[slot] = ev.nid;
                    } else if !all_nids.contains(&ev.nid) {
                        all_nids.push(ev.nid);
                    }
                }
                let events = self.accumulator.events.select_by_nids(&mut txn, &all_nids).await?;
                result.insert(ev.room_id.clone(), events);
            }
            txn.commit().await?;
            return Ok(result);
        }

        // Filtered path: one query pulling exactly the requested
        // (type, state_key) pairs out of the union of the relevant
        // snapshots, pruned to the membership or non-membership half when
        // the filter permits.
        let mut wheres = Vec::new();
        let mut binds: Vec<&str> = Vec::new();
        let mut has_membership_filter = false;
        let mut has_other_filter = false;
        for (ev_type, state_keys) in filter {
            if ev_type == EVENT_TYPE_MEMBER {
                has_membership_filter = true;
            } else {
                has_other_filter = true;
            }
            for key in state_keys {
                binds.push(ev_type.as_str());
                binds.push(key.as_str());
                wheres.push(format!(
                    "(event_type = ${} AND state_key = ${})",
                    binds.len() - 1,
                    binds.len()
                ));
            }
            if state_keys.is_empty() {
                binds.push(ev_type.as_str());
                wheres.push(format!("event_type = ${}", binds.len()));
            }
        }
        let nid_cols = if has_membership_filter && !has_other_filter {
            "unnest(membership_events)"
        } else if !has_membership_filter && has_other_filter {
            "unnest(events)"
        } else {
            "unnest(array_cat(events, membership_events))"
        };
        let snapshot_ids: Vec<i64> = latest_events
            .iter()
            .map(|ev| ev.before_state_snapshot_id)
            .collect();
        let sql = format!(
            "SELECT {EVENT_COLS} FROM syncv3_events \
             WHERE ({}) AND event_nid IN ( \
               SELECT {nid_cols} FROM syncv3_snapshots WHERE snapshot_id = ANY(${}) \
             ) ORDER BY event_nid ASC",
            wheres.join(" OR "),
            binds.len() + 1
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(*bind);
        }
        query = query.bind(&snapshot_ids);
        let rows = query.fetch_all(&mut *txn).await?;

        let room_index: HashMap<&str, &Event> = latest_events
            .iter()
            .map(|ev| (ev.room_id.as_str(), ev))
            .collect();
        for row in &rows {
            let mut ev = event_from_row(row)?;
            if let Some(latest) = room_index.get(ev.room_id.as_str()) {
                if latest.replaces_nid == ev.nid {
                    // superseded by the latest event itself
                    ev = (*latest).clone();
                }
            }
            result.entry(ev.room_id.clone()).or_default().push(ev);
        }
        // the latest events won't be in their own before-snapshots; append
        // brand new state if the filter asks for it
        for ev in &latest_events {
            if ev.replaces_nid != 0 || !ev.is_state_event() {
                continue;
            }
            let included = filter.get(&ev.event_type).is_some_and(|keys| {
                keys.is_empty() || keys.iter().any(|k| *k == ev.state_key)
            });
            if included {
                result.entry(ev.room_id.clone()).or_default().push(ev.clone());
            }
        }
        txn.commit().await?;
        Ok(result)
    }

    // =========================================================================
    // Timeline slices
    // =========================================================================

    /// The most recent `limit` events visible to `user_id` in each room, in
    /// chronological order, plus a pagination token per room that can reach
    /// further back than the earliest returned event.
    pub async fn latest_events_in_rooms(
        &self,
        user_id: &str,
        room_ids: &[String],
        to: i64,
        limit: usize,
    ) -> Result<(HashMap<String, Vec<Value>>, HashMap<String, String>)> {
        let mut txn = self.pool.begin().await?;
        let ranges_by_room = self
            .visible_event_nids_between_for_rooms_txn(&mut txn, user_id, room_ids, 0, to)
            .await?;
        let mut result = HashMap::with_capacity(room_ids.len());
        let mut prev_batches = HashMap::new();
        for (room_id, ranges) in ranges_by_room {
            let mut room_events: Vec<Value> = Vec::new();
            let mut earliest_nid = 0;
            // start at the most recent range: we want the most recent events
            for range in ranges.iter().rev() {
                if room_events.len() >= limit {
                    break;
                }
                let events = self
                    .accumulator
                    .events
                    .select_latest_events_between(
                        &mut txn,
                        &room_id,
                        range[0] - 1,
                        range[1],
                        limit as i64,
                    )
                    .await?;
                // events arrive most-recent-first; push to the front so the
                // result reads A, B, C
                for ev in events {
                    earliest_nid = ev.nid;
                    room_events.insert(0, ev.json);
                    if room_events.len() >= limit {
                        break;
                    }
                }
            }
            if earliest_nid != 0 {
                if let Some(token) = self
                    .accumulator
                    .events
                    .select_closest_prev_batch(&mut txn, &room_id, earliest_nid)
                    .await?
                {
                    prev_batches.insert(room_id.clone(), token);
                }
            }
            result.insert(room_id, room_events);
        }
        txn.commit().await?;
        Ok((result, prev_batches))
    }

    /// The membership events in a room with `from < nid <= to`, capped at
    /// `limit`, plus the highest NID returned so callers can page.
    pub async fn room_membership_delta(
        &self,
        room_id: &str,
        from: i64,
        to: i64,
        limit: i64,
    ) -> Result<(Vec<Value>, i64)> {
        let mut txn = self.pool.begin().await?;
        let nids = self
            .accumulator
            .events
            .select_event_nids_with_type_in_room(&mut txn, EVENT_TYPE_MEMBER, limit, room_id, from, to)
            .await?;
        if nids.is_empty() {
            txn.commit().await?;
            return Ok((Vec::new(), 0));
        }
        let up_to = nids.last().copied().unwrap_or(0);
        let events = self.accumulator.events.select_by_nids(&mut txn, &nids).await?;
        txn.commit().await?;
        Ok((events.into_iter().map(|e| e.json).collect(), up_to))
    }

    // =========================================================================
    // Visibility
    // =========================================================================

    /// The inclusive NID sub-intervals of `[from, to]` during which
    /// `user_id` could see events, per room: the spans where the user was
    /// joined, plus a singleton interval per invite.
    ///
    /// For example, with membership events J=join, L=leave, I=invite at the
    /// marked positions:
    ///
    /// ```text
    ///          1   2   3   4   5   6   7   8   9   10
    /// Room A   J           L           J
    /// Room B           I
    /// ```
    ///
    /// `visible_event_nids_between(user, 1, 10)` returns
    /// `{A: [[1,4], [7,10]], B: [[3,3]]}`.
    pub async fn visible_event_nids_between(
        &self,
        user_id: &str,
        from: i64,
        to: i64,
    ) -> Result<HashMap<String, Vec<[i64; 2]>>> {
        let mut txn = self.pool.begin().await?;
        let membership_events = self
            .accumulator
            .events
            .select_events_with_type_state_key(&mut txn, EVENT_TYPE_MEMBER, user_id, 0, from)
            .await?;
        let joined_at_from = determine_joined_rooms_from_memberships(&membership_events);

        let logs = self
            .accumulator
            .events
            .select_events_with_type_state_key(&mut txn, EVENT_TYPE_MEMBER, user_id, from, to)
            .await?;
        txn.commit().await?;
        Ok(visible_event_nids_with_data(joined_at_from, &logs, from, to))
    }

    /// As [`Storage::visible_event_nids_between`], restricted to the
    /// supplied rooms.
    pub async fn visible_event_nids_between_for_rooms(
        &self,
        user_id: &str,
        room_ids: &[String],
        from: i64,
        to: i64,
    ) -> Result<HashMap<String, Vec<[i64; 2]>>> {
        let mut txn = self.pool.begin().await?;
        let result = self
            .visible_event_nids_between_for_rooms_txn(&mut txn, user_id, room_ids, from, to)
            .await?;
        txn.commit().await?;
        Ok(result)
    }

    async fn visible_event_nids_between_for_rooms_txn(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        user_id: &str,
        room_ids: &[String],
        from: i64,
        to: i64,
    ) -> Result<HashMap<String, Vec<[i64; 2]>>> {
        let membership_events = if from != 0 {
            self.accumulator
                .events
                .select_events_with_type_state_key_in_rooms(
                    txn,
                    room_ids,
                    EVENT_TYPE_MEMBER,
                    user_id,
                    0,
                    from,
                )
                .await?
        } else {
            // nothing can precede position zero
            Vec::new()
        };
        let joined_at_from = determine_joined_rooms_from_memberships(&membership_events);

        let logs = self
            .accumulator
            .events
            .select_events_with_type_state_key_in_rooms(
                txn,
                room_ids,
                EVENT_TYPE_MEMBER,
                user_id,
                from,
                to,
            )
            .await?;
        Ok(visible_event_nids_with_data(joined_at_from, &logs, from, to))
    }

    /// room_id → join NID for every room `user_id` is joined to at `pos`.
    pub async fn joined_rooms_after_position(
        &self,
        user_id: &str,
        pos: i64,
    ) -> Result<HashMap<String, i64>> {
        let mut txn = self.pool.begin().await?;
        let membership_events = self
            .accumulator
            .events
            .select_events_with_type_state_key(&mut txn, EVENT_TYPE_MEMBER, user_id, 0, pos)
            .await?;
        txn.commit().await?;
        Ok(determine_joined_rooms_from_memberships(&membership_events))
    }
}

// =============================================================================
// Membership replay
// =============================================================================

/// One membership transition for a user in a room.
#[derive(Debug, Clone)]
struct MembershipLog {
    nid: i64,
    membership: String,
}

/// Replays a user's membership events to find the rooms they are joined to
/// at the end, mapping room_id → the NID of the join that got them there.
///
/// Events must be sorted by NID ascending and belong to a single user;
/// neither precondition is checked here. The membership string is read from
/// the JSON body, so state-block rows replay identically to timeline rows.
pub fn determine_joined_rooms_from_memberships(membership_events: &[Event]) -> HashMap<String, i64> {
    let mut joined = HashMap::with_capacity(membership_events.len());
    for ev in membership_events {
        match ev
            .json
            .pointer("/content/membership")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            MEMBERSHIP_JOIN => {
                // only the join that entered the room counts; a later
                // profile-change join must not move the join NID
                joined.entry(ev.room_id.clone()).or_insert(ev.nid);
            }
            MEMBERSHIP_LEAVE | MEMBERSHIP_BAN => {
                joined.remove(&ev.room_id);
            }
            _ => {}
        }
    }
    joined
}

/// Buckets the membership log by room and runs the interval algorithm:
/// rooms joined at `from` seed an open interval there; rooms only touched
/// inside the window start unjoined.
fn visible_event_nids_with_data(
    joined_at_from: HashMap<String, i64>,
    membership_events: &[Event],
    from: i64,
    to: i64,
) -> HashMap<String, Vec<[i64; 2]>> {
    let mut logs_by_room: HashMap<String, Vec<MembershipLog>> = HashMap::new();
    for ev in membership_events {
        let membership = ev
            .json
            .pointer("/content/membership")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        logs_by_room
            .entry(ev.room_id.clone())
            .or_default()
            .push(MembershipLog { nid: ev.nid, membership });
    }

    let mut result = HashMap::new();
    for room_id in joined_at_from.keys() {
        let logs = logs_by_room.remove(room_id).unwrap_or_default();
        result.insert(
            room_id.clone(),
            calculate_visible_event_nids(true, from, to, &logs),
        );
    }
    for (room_id, logs) in logs_by_room {
        let intervals = calculate_visible_event_nids(false, from, to, &logs);
        if !intervals.is_empty() {
            result.insert(room_id, intervals);
        }
    }
    result
}

/// The interval walk for one room. Valid transitions are join → leave|ban
/// and leave|invite → join; anything else in the log (e.g. leave → ban) is
/// skipped. Invites produce point intervals and never open or close a span.
fn calculate_visible_event_nids(
    initially_joined: bool,
    from: i64,
    to: i64,
    logs: &[MembershipLog],
) -> Vec<[i64; 2]> {
    if logs.is_empty() {
        return if initially_joined {
            vec![[from, to]]
        } else {
            Vec::new()
        };
    }
    let mut result = Vec::new();
    let mut joined = initially_joined;
    let mut start = from;
    for log in logs {
        match log.membership.as_str() {
            MEMBERSHIP_LEAVE | MEMBERSHIP_BAN if joined => {
                // the leaver sees their own leave event
                result.push([start, log.nid]);
                joined = false;
            }
            MEMBERSHIP_JOIN if !joined => {
                start = log.nid;
                joined = true;
            }
            MEMBERSHIP_INVITE if !joined => {
                result.push([log.nid, log.nid]);
            }
            _ => {}
        }
    }
    if joined {
        result.push([start, to]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_event(nid: i64, room_id: &str, user_id: &str, membership: &str) -> Event {
        let mut ev = Event::from_json(
            room_id,
            json!({
                "event_id": format!("$m{nid}"),
                "type": "m.room.member",
                "state_key": user_id,
                "content": {"membership": membership},
            }),
            false,
        )
        .unwrap();
        ev.nid = nid;
        ev
    }

    fn log(nid: i64, membership: &str) -> MembershipLog {
        MembershipLog {
            nid,
            membership: membership.to_string(),
        }
    }

    /// Join at 1, leave at 5, rejoin at 8, plus an invite to another room at
    /// 12: `[[1,5],[8,15]]` for the first room, `[[12,12]]` for the second.
    #[test]
    fn test_visibility_intervals_multi_join_and_invite() {
        let events = vec![
            member_event(1, "!r:s", "@u:s", "join"),
            member_event(5, "!r:s", "@u:s", "leave"),
            member_event(8, "!r:s", "@u:s", "join"),
            member_event(12, "!other:s", "@u:s", "invite"),
        ];
        let result = visible_event_nids_with_data(HashMap::new(), &events, 1, 15);
        assert_eq!(result["!r:s"], vec![[1, 5], [8, 15]]);
        assert_eq!(result["!other:s"], vec![[12, 12]]);
    }

    /// A room joined before the window with no deltas inside it spans the
    /// whole window.
    #[test]
    fn test_visibility_already_joined_no_deltas() {
        let mut joined = HashMap::new();
        joined.insert("!r:s".to_string(), 3i64);
        let result = visible_event_nids_with_data(joined, &[], 10, 20);
        assert_eq!(result["!r:s"], vec![[10, 20]]);
    }

    /// A leave inside the window closes the open interval at the leave NID.
    #[test]
    fn test_visibility_leave_closes_interval() {
        let mut joined = HashMap::new();
        joined.insert("!r:s".to_string(), 1i64);
        let events = vec![member_event(14, "!r:s", "@u:s", "leave")];
        let result = visible_event_nids_with_data(joined, &events, 10, 20);
        assert_eq!(result["!r:s"], vec![[10, 14]]);
    }

    /// From position zero, intervals start at the join NID, never at zero.
    #[test]
    fn test_visibility_from_zero_starts_at_join() {
        let events = vec![member_event(4, "!r:s", "@u:s", "join")];
        let result = visible_event_nids_with_data(HashMap::new(), &events, 0, 10);
        assert_eq!(result["!r:s"], vec![[4, 10]]);
    }

    /// Invalid transitions (leave → ban, join → join) don't disturb the
    /// walk.
    #[test]
    fn test_visibility_ignores_invalid_transitions() {
        let logs = vec![
            log(2, "join"),
            log(3, "join"), // profile change
            log(5, "leave"),
            log(6, "ban"), // leave → ban, no-op
            log(8, "join"),
        ];
        let intervals = calculate_visible_event_nids(false, 0, 10, &logs);
        assert_eq!(intervals, vec![[2, 5], [8, 10]]);
    }

    /// Invites while joined are ignored; invites while unjoined are point
    /// intervals.
    #[test]
    fn test_visibility_invite_handling() {
        let logs = vec![log(2, "invite"), log(4, "join"), log(6, "invite"), log(9, "leave")];
        let intervals = calculate_visible_event_nids(false, 0, 10, &logs);
        assert_eq!(intervals, vec![[2, 2], [4, 9]]);
    }

    #[test]
    fn test_determine_joined_rooms() {
        let events = vec![
            member_event(1, "!a:s", "@u:s", "join"),
            member_event(2, "!b:s", "@u:s", "join"),
            member_event(3, "!a:s", "@u:s", "join"), // profile change
            member_event(4, "!b:s", "@u:s", "leave"),
            member_event(5, "!c:s", "@u:s", "invite"),
        ];
        let joined = determine_joined_rooms_from_memberships(&events);
        assert_eq!(joined.len(), 1);
        // the original join NID survives the profile change
        assert_eq!(joined["!a:s"], 1);
    }
}
