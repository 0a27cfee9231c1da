//! # Spaces Table
//!
//! Parent→child relationship index for hierarchical rooms. Relations are
//! asserted by `m.space.child` / `m.space.parent` state events whose content
//! carries a `via` server list; a relation event without `via` is the
//! protocol's way of deleting the relation, so it removes the row.

use std::collections::HashMap;

use sqlx::{Postgres, Row, Transaction};

use crate::error::Result;
use crate::types::SpaceRelation;

/// Accessor struct for `syncv3_spaces`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpacesTable;

impl SpacesTable {
    /// Upserts the given relations; re-asserting a relation refreshes its
    /// ordering hint.
    pub async fn bulk_insert(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        relations: &[SpaceRelation],
    ) -> Result<()> {
        for rel in relations {
            sqlx::query(
                "INSERT INTO syncv3_spaces (parent_room_id, child_room_id, relation, ordering) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (parent_room_id, child_room_id, relation) \
                 DO UPDATE SET ordering = EXCLUDED.ordering",
            )
            .bind(&rel.parent)
            .bind(&rel.child)
            .bind(&rel.relation)
            .bind(&rel.ordering)
            .execute(&mut **txn)
            .await?;
        }
        Ok(())
    }

    /// Deletes the given relations; absent rows are ignored.
    pub async fn bulk_delete(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        relations: &[SpaceRelation],
    ) -> Result<()> {
        for rel in relations {
            sqlx::query(
                "DELETE FROM syncv3_spaces \
                 WHERE parent_room_id = $1 AND child_room_id = $2 AND relation = $3",
            )
            .bind(&rel.parent)
            .bind(&rel.child)
            .bind(&rel.relation)
            .execute(&mut **txn)
            .await?;
        }
        Ok(())
    }

    /// All relations whose parent is one of the listed rooms, grouped by
    /// parent.
    pub async fn select_children(
        &self,
        txn: &mut Transaction<'_, Postgres>,
        parents: &[String],
    ) -> Result<HashMap<String, Vec<SpaceRelation>>> {
        let rows = sqlx::query(
            "SELECT parent_room_id, child_room_id, relation, ordering \
             FROM syncv3_spaces WHERE parent_room_id = ANY($1)",
        )
        .bind(parents)
        .fetch_all(&mut **txn)
        .await?;
        let mut out: HashMap<String, Vec<SpaceRelation>> = HashMap::new();
        for row in &rows {
            let rel = SpaceRelation {
                parent: row.try_get("parent_room_id")?,
                child: row.try_get("child_room_id")?,
                relation: row.try_get("relation")?,
                ordering: row.try_get("ordering")?,
            };
            out.entry(rel.parent.clone()).or_default().push(rel);
        }
        Ok(out)
    }
}
