//! # Event Table
//!
//! The content-addressed event store. A unique numeric ID (NID) drawn from a
//! single global sequence is associated with each event; `event_id` is the
//! content address and duplicate inserts are conflict-safe no-ops that never
//! consume a NID.
//!
//! All operations run on a caller-supplied transaction so the storage facade
//! can compose multi-table reads with a consistent view. Bulk lookups bind
//! Postgres arrays (`= ANY($1)` is one parameter regardless of length); the
//! bulk insert materializes one array element per row and column and is
//! chunked below the statement parameter cap.

use std::collections::HashMap;

use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

use crate::error::Result;
use crate::sqlutil::{chunkify, MAX_POSTGRES_PARAMETERS};
use crate::types::{Event, StrippedEvent};

/// Full column list for queries that materialize [`Event`] rows.
pub(crate) const EVENT_COLS: &str = "event_nid, event_id, room_id, event_type, state_key, \
     COALESCE(membership, '') AS membership, before_state_snapshot_id, replaces_nid, \
     prev_batch, is_state, event";

/// Parameters per row in the bulk insert below.
const INSERT_PARAMS_PER_ROW: usize = 8;

pub(crate) fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        nid: row.try_get("event_nid")?,
        id: row.try_get("event_id")?,
        room_id: row.try_get("room_id")?,
        event_type: row.try_get("event_type")?,
        state_key: row.try_get("state_key")?,
        membership: row.try_get("membership")?,
        before_state_snapshot_id: row.try_get("before_state_snapshot_id")?,
        replaces_nid: row.try_get("replaces_nid")?,
        prev_batch: row.try_get("prev_batch")?,
        is_state: row.try_get("is_state")?,
        json: row.try_get("event")?,
    })
}

/// Accessor struct for `syncv3_events`. Stateless; all state lives in
/// Postgres.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventTable;

impl EventTable {
    /// Inserts events, skipping rows whose `event_id` already exists.
    /// Returns the number of rows actually inserted. If the input is in
    /// stream order, the tail of the input corresponds to the new rows.
    ///
    /// Events must have their denormalized fields populated
    /// ([`Event::from_json`] does this); NIDs are assigned by the database
    /// and are *not* filled back here — re-read via
    /// [`EventTable::select_nids_by_ids`].
    pub async fn insert(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        events: &[Event],
    ) -> Result<usize> {
        let mut inserted = 0;
        for chunk in chunkify(INSERT_PARAMS_PER_ROW, MAX_POSTGRES_PARAMETERS, events.len())? {
            let batch = &events[chunk];
            let mut ids = Vec::with_capacity(batch.len());
            let mut rooms = Vec::with_capacity(batch.len());
            let mut types = Vec::with_capacity(batch.len());
            let mut state_keys = Vec::with_capacity(batch.len());
            let mut memberships = Vec::with_capacity(batch.len());
            let mut prev_batches = Vec::with_capacity(batch.len());
            let mut is_states = Vec::with_capacity(batch.len());
            let mut bodies = Vec::with_capacity(batch.len());
            for ev in batch {
                ids.push(ev.id.clone());
                rooms.push(ev.room_id.clone());
                types.push(ev.event_type.clone());
                state_keys.push(ev.state_key.clone());
                memberships.push(ev.membership.clone());
                prev_batches.push(ev.prev_batch.clone().unwrap_or_default());
                is_states.push(ev.is_state);
                bodies.push(ev.json.to_string());
            }
            let res = sqlx::query(
                r#"INSERT INTO syncv3_events
                     (event_id, room_id, event_type, state_key, membership, prev_batch, is_state, event)
                   SELECT u.event_id, u.room_id, u.event_type, u.state_key,
                          NULLIF(u.membership, ''), NULLIF(u.prev_batch, ''), u.is_state, u.event::jsonb
                   FROM UNNEST($1::text[], $2::text[], $3::text[], $4::text[],
                               $5::text[], $6::text[], $7::bool[], $8::text[])
                     AS u(event_id, room_id, event_type, state_key, membership, prev_batch, is_state, event)
                   ON CONFLICT (event_id) DO NOTHING"#,
            )
            .bind(&ids)
            .bind(&rooms)
            .bind(&types)
            .bind(&state_keys)
            .bind(&memberships)
            .bind(&prev_batches)
            .bind(&is_states)
            .bind(&bodies)
            .execute(&mut **txn)
            .await?;
            inserted += res.rows_affected() as usize;
        }
        Ok(inserted)
    }

    /// Events for the given NIDs, ordered by NID ascending. Unknown NIDs are
    /// silently absent.
    pub async fn select_by_nids(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        nids: &[i64],
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events WHERE event_nid = ANY($1) ORDER BY event_nid ASC"
        ))
        .bind(nids)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Events for the given event IDs, in no particular order.
    pub async fn select_by_ids(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events WHERE event_id = ANY($1)"
        ))
        .bind(ids)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Maps event IDs to their NIDs. IDs the store has never seen are simply
    /// absent from the map, which is how callers detect unknown events.
    pub async fn select_nids_by_ids(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let rows =
            sqlx::query("SELECT event_id, event_nid FROM syncv3_events WHERE event_id = ANY($1)")
                .bind(ids)
                .fetch_all(&mut **txn)
                .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            out.insert(row.try_get("event_id")?, row.try_get("event_nid")?);
        }
        Ok(out)
    }

    /// `(NID, type, state_key)` tuples for the given NIDs; enough to roll a
    /// snapshot forward without loading event bodies.
    pub async fn select_stripped_events_by_nids(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        nids: &[i64],
    ) -> Result<Vec<StrippedEvent>> {
        let rows = sqlx::query(
            "SELECT event_nid, event_type, state_key FROM syncv3_events WHERE event_nid = ANY($1)",
        )
        .bind(nids)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(StrippedEvent {
                    nid: row.try_get("event_nid")?,
                    event_type: row.try_get("event_type")?,
                    state_key: row.try_get("state_key")?,
                })
            })
            .collect()
    }

    /// The maximum NID ever issued, zero when the store is empty.
    pub async fn select_highest_nid(&self, txn: &mut Transaction<'_, Postgres>) -> Result<i64> {
        let row = sqlx::query("SELECT MAX(event_nid) AS nid FROM syncv3_events")
            .fetch_one(&mut **txn)
            .await?;
        Ok(row.try_get::<Option<i64>, _>("nid")?.unwrap_or(0))
    }

    /// The most recent timeline events in `room_id` with
    /// `after < nid <= up_to`, most-recent-first, capped at `limit`.
    /// State-block rows are excluded so initial state never renders as
    /// timeline messages.
    pub async fn select_latest_events_between(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_id: &str,
        after: i64,
        up_to: i64,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events \
             WHERE room_id = $1 AND event_nid > $2 AND event_nid <= $3 AND is_state = FALSE \
             ORDER BY event_nid DESC LIMIT $4"
        ))
        .bind(room_id)
        .bind(after)
        .bind(up_to)
        .bind(limit)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// All events with the given type and state key, across all rooms, with
    /// `from < nid <= to`, NID ascending. Drives membership replay.
    pub async fn select_events_with_type_state_key(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        event_type: &str,
        state_key: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events \
             WHERE event_type = $1 AND state_key = $2 AND event_nid > $3 AND event_nid <= $4 \
             ORDER BY event_nid ASC"
        ))
        .bind(event_type)
        .bind(state_key)
        .bind(from)
        .bind(to)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// As [`EventTable::select_events_with_type_state_key`], restricted to
    /// the supplied rooms.
    pub async fn select_events_with_type_state_key_in_rooms(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_ids: &[String],
        event_type: &str,
        state_key: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLS} FROM syncv3_events \
             WHERE room_id = ANY($1) AND event_type = $2 AND state_key = $3 \
               AND event_nid > $4 AND event_nid <= $5 \
             ORDER BY event_nid ASC"
        ))
        .bind(room_ids)
        .bind(event_type)
        .bind(state_key)
        .bind(from)
        .bind(to)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// NIDs of events of the given type in one room with `from < nid <= to`,
    /// ascending, capped at `limit`.
    pub async fn select_event_nids_with_type_in_room(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        event_type: &str,
        limit: i64,
        room_id: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT event_nid FROM syncv3_events \
             WHERE event_type = $1 AND room_id = $2 AND event_nid > $3 AND event_nid <= $4 \
             ORDER BY event_nid ASC LIMIT $5",
        )
        .bind(event_type)
        .bind(room_id)
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("event_nid")?))
            .collect()
    }

    /// The single latest event per listed room with `nid <= up_to`. The
    /// position may belong to a different room entirely, hence the per-room
    /// max rather than a plain lookup.
    pub async fn latest_event_in_rooms(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_ids: &[String],
        up_to: i64,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (room_id) {EVENT_COLS} FROM syncv3_events \
             WHERE room_id = ANY($1) AND event_nid <= $2 \
             ORDER BY room_id, event_nid DESC"
        ))
        .bind(room_ids)
        .bind(up_to)
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// The `prev_batch` token on the event at or immediately preceding `nid`
    /// in `room_id`: the head token of the chunk that covers that position,
    /// able to paginate back past it.
    pub async fn select_closest_prev_batch(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_id: &str,
        nid: i64,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT prev_batch FROM syncv3_events \
             WHERE room_id = $1 AND event_nid <= $2 AND prev_batch IS NOT NULL \
             ORDER BY event_nid DESC LIMIT 1",
        )
        .bind(room_id)
        .bind(nid)
        .fetch_optional(&mut **txn)
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get("prev_batch")?)),
            None => Ok(None),
        }
    }

    /// The latest event per `(room, event_type)` pair, across all rooms.
    /// Feeds the global snapshot's last-timestamp and latest-by-type
    /// metadata.
    pub async fn select_latest_event_by_type_in_all_rooms(
        &self,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (room_id, event_type) {EVENT_COLS} FROM syncv3_events \
             ORDER BY room_id, event_type, event_nid DESC"
        ))
        .fetch_all(&mut **txn)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Stamps the snapshot linkage onto an inserted event: the state the
    /// room was in before it, and (for state events) the NID it supersedes.
    pub async fn update_snapshot_linkage(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        nid: i64,
        before_state_snapshot_id: i64,
        replaces_nid: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE syncv3_events SET before_state_snapshot_id = $1, replaces_nid = $2 \
             WHERE event_nid = $3",
        )
        .bind(before_state_snapshot_id)
        .bind(replaces_nid)
        .bind(nid)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }
}
