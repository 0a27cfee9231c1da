//! # Snapshot Table
//!
//! Write-once records naming a room's state as two NID lists (membership
//! events and everything else). Snapshots are values: once written they are
//! never mutated, and old snapshots stay referenced by events'
//! `before_state_snapshot_id` so state-after-event reads remain cheap
//! forever. Deletion only happens as part of a retention policy outside the
//! core.

use sqlx::{Postgres, Row, Transaction};

use crate::error::{Error, Result};
use crate::types::SnapshotRow;

/// Accessor struct for `syncv3_snapshots`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotTable;

impl SnapshotTable {
    /// Writes a new snapshot and returns its id. Ids are strictly increasing
    /// within a room in ingestion order.
    pub async fn insert(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        room_id: &str,
        membership_events: &[i64],
        other_events: &[i64],
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO syncv3_snapshots (room_id, events, membership_events) \
             VALUES ($1, $2, $3) RETURNING snapshot_id",
        )
        .bind(room_id)
        .bind(other_events)
        .bind(membership_events)
        .fetch_one(&mut **txn)
        .await?;
        Ok(row.try_get("snapshot_id")?)
    }

    /// Loads a snapshot by id.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id references no row; the caller decides whether
    /// that is fatal.
    pub async fn select(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        snapshot_id: i64,
    ) -> Result<SnapshotRow> {
        let row = sqlx::query(
            "SELECT snapshot_id, room_id, events, membership_events \
             FROM syncv3_snapshots WHERE snapshot_id = $1",
        )
        .bind(snapshot_id)
        .fetch_optional(&mut **txn)
        .await?
        .ok_or(Error::NotFound {
            kind: "snapshot",
            id: snapshot_id.to_string(),
        })?;
        Ok(SnapshotRow {
            snapshot_id: row.try_get("snapshot_id")?,
            room_id: row.try_get("room_id")?,
            other_events: row.try_get("events")?,
            membership_events: row.try_get("membership_events")?,
        })
    }
}
