//! # Rooms Table
//!
//! One row per room: the single mutable pointer (`current_snapshot_id`), the
//! NID that snapshot was computed against (`latest_nid`) and cached flags.
//! Only the accumulator writes here, inside the ingestion transaction and
//! *after* the snapshot row it points at, so any reader observes either the
//! old snapshot or the new one atomically.

use std::collections::HashMap;

use sqlx::{Postgres, Row, Transaction};

use crate::error::Result;
use crate::types::RoomInfo;

/// Accessor struct for `syncv3_rooms`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoomsTable;

impl RoomsTable {
    /// The NID of the latest event ingested per listed room. May race
    /// slightly ahead of a reader's position; the state-after-position read
    /// branches on exactly this comparison. Rooms with no row are absent.
    pub async fn latest_nids(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let rows =
            sqlx::query("SELECT room_id, latest_nid FROM syncv3_rooms WHERE room_id = ANY($1)")
                .bind(room_ids)
                .fetch_all(&mut **txn)
                .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            out.insert(row.try_get("room_id")?, row.try_get("latest_nid")?);
        }
        Ok(out)
    }

    /// The snapshot representing state *after* the most recently ingested
    /// event, zero when the room has never been initialised.
    pub async fn current_after_snapshot_id(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_id: &str,
    ) -> Result<i64> {
        let row = sqlx::query("SELECT current_snapshot_id FROM syncv3_rooms WHERE room_id = $1")
            .bind(room_id)
            .fetch_optional(&mut **txn)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("current_snapshot_id")?),
            None => Ok(0),
        }
    }

    /// All rooms with their cached flags.
    pub async fn select_room_infos(
        &self,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<RoomInfo>> {
        let rows = sqlx::query(
            "SELECT room_id, is_encrypted, type, predecessor_room_id, upgraded_room_id \
             FROM syncv3_rooms",
        )
        .fetch_all(&mut **txn)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(RoomInfo {
                    room_id: row.try_get("room_id")?,
                    is_encrypted: row.try_get("is_encrypted")?,
                    room_type: row.try_get("type")?,
                    predecessor_room_id: row.try_get("predecessor_room_id")?,
                    upgraded_room_id: row.try_get("upgraded_room_id")?,
                })
            })
            .collect()
    }

    /// Advances the room pointer and folds in flag updates. Called only from
    /// the accumulator within the ingestion transaction.
    ///
    /// The encryption flag latches (`OR`), the pointer fields only move from
    /// unset to set (`COALESCE` with the incoming value first), and
    /// `latest_nid` always advances to the supplied value.
    pub async fn upsert(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        info: &RoomInfo,
        current_snapshot_id: i64,
        latest_nid: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO syncv3_rooms \
               (room_id, current_snapshot_id, latest_nid, is_encrypted, type, predecessor_room_id, upgraded_room_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (room_id) DO UPDATE SET \
               current_snapshot_id = EXCLUDED.current_snapshot_id, \
               latest_nid = EXCLUDED.latest_nid, \
               is_encrypted = syncv3_rooms.is_encrypted OR EXCLUDED.is_encrypted, \
               type = COALESCE(EXCLUDED.type, syncv3_rooms.type), \
               predecessor_room_id = COALESCE(EXCLUDED.predecessor_room_id, syncv3_rooms.predecessor_room_id), \
               upgraded_room_id = COALESCE(EXCLUDED.upgraded_room_id, syncv3_rooms.upgraded_room_id)",
        )
        .bind(&info.room_id)
        .bind(current_snapshot_id)
        .bind(latest_nid)
        .bind(info.is_encrypted)
        .bind(&info.room_type)
        .bind(&info.predecessor_room_id)
        .bind(&info.upgraded_room_id)
        .execute(&mut **txn)
        .await?;
        Ok(())
    }
}
