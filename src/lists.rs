//! # List Materialization
//!
//! The request engine maintains, per client connection, one materialized
//! room list per request list: the connection's room universe filtered by
//! the list's filters and held in the list's sort order. When a room's
//! position changes, the engine emits the ordered `DELETE`/`INSERT`
//! operations that move the client's tracked window into the new shape.
//!
//! A move whose *origin* index is outside every tracked range is invisible:
//! the delete half would land at an index the client is not tracking, so
//! nothing is emitted and the client picks the room up on its next window
//! request.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::metadata::{calculate_room_name, RoomMetadata};
use crate::request::{
    apply_delta, write_swap_op, Request, RequestDelta, RequestFilters, RequestList, ResponseOp,
    SORT_BY_HIGHLIGHT_COUNT, SORT_BY_NAME, SORT_BY_NOTIFICATION_COUNT, SORT_BY_RECENCY,
};

/// Space room id → transitive descendant room ids, derived from the space
/// children in the global snapshot. Consulted by the `spaces` filter.
pub type SpaceDescendants = HashMap<String, HashSet<String>>;

/// Builds the descendant index from global metadata: every space maps to
/// all rooms reachable through `m.space.child` assertions, including
/// children of nested spaces.
pub fn build_space_descendants(metadata: &HashMap<String, RoomMetadata>) -> SpaceDescendants {
    let mut out = SpaceDescendants::new();
    for (room_id, m) in metadata {
        if !m.is_space() {
            continue;
        }
        let mut descendants = HashSet::new();
        let mut stack: Vec<&String> = m.child_space_rooms.iter().collect();
        while let Some(child) = stack.pop() {
            if !descendants.insert(child.clone()) {
                continue;
            }
            if let Some(child_meta) = metadata.get(child) {
                if child_meta.is_space() {
                    stack.extend(child_meta.child_space_rooms.iter());
                }
            }
        }
        out.insert(room_id.clone(), descendants);
    }
    out
}

/// A room as seen by one connection: global metadata plus the user-scoped
/// bits the sort orders and filters need. The engine never computes the
/// notification counts; callers feed them in from their own side tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomListEntry {
    pub metadata: RoomMetadata,
    pub is_dm: bool,
    pub is_invite: bool,
    pub notification_count: i64,
    pub highlight_count: i64,
}

impl RoomListEntry {
    pub fn room_id(&self) -> &str {
        &self.metadata.room_id
    }
}

fn compare(a: &RoomListEntry, b: &RoomListEntry, sort_by: &[String]) -> Ordering {
    for key in sort_by {
        let ord = match key.as_str() {
            SORT_BY_RECENCY => b
                .metadata
                .last_message_timestamp
                .cmp(&a.metadata.last_message_timestamp),
            SORT_BY_NAME => calculate_room_name(&a.metadata)
                .to_lowercase()
                .cmp(&calculate_room_name(&b.metadata).to_lowercase()),
            SORT_BY_NOTIFICATION_COUNT => b.notification_count.cmp(&a.notification_count),
            SORT_BY_HIGHLIGHT_COUNT => b.highlight_count.cmp(&a.highlight_count),
            _ => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    // deterministic tiebreak so repeated materializations agree
    a.metadata.room_id.cmp(&b.metadata.room_id)
}

// =============================================================================
// Sortable rooms
// =============================================================================

/// A room list held in a fixed sort order, with O(1) room → index lookup.
#[derive(Debug, Clone, Default)]
pub struct SortableRooms {
    entries: Vec<RoomListEntry>,
    index: HashMap<String, usize>,
    sort_by: Vec<String>,
}

impl SortableRooms {
    pub fn new(sort_by: Vec<String>) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            sort_by,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, room_id: &str) -> Option<usize> {
        self.index.get(room_id).copied()
    }

    pub fn entry_at(&self, index: usize) -> Option<&RoomListEntry> {
        self.entries.get(index)
    }

    pub fn room_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.room_id())
    }

    /// Replaces the whole list and sorts it.
    pub fn set_rooms(&mut self, rooms: Vec<RoomListEntry>) {
        self.entries = rooms;
        let sort_by = self.sort_by.clone();
        self.entries.sort_by(|a, b| compare(a, b, &sort_by));
        self.reindex();
    }

    /// Inserts a new room at its sorted position, returning that position.
    pub fn insert(&mut self, entry: RoomListEntry) -> usize {
        let to = self
            .entries
            .partition_point(|e| compare(e, &entry, &self.sort_by) == Ordering::Less);
        self.entries.insert(to, entry);
        self.reindex();
        to
    }

    /// Removes a room, returning the index it occupied.
    pub fn remove(&mut self, room_id: &str) -> Option<usize> {
        let from = self.index_of(room_id)?;
        self.entries.remove(from);
        self.reindex();
        Some(from)
    }

    /// Replaces a room's entry and moves it to its new sorted position.
    /// Returns `(from, to)`.
    pub fn update(&mut self, entry: RoomListEntry) -> Option<(usize, usize)> {
        let from = self.index_of(entry.room_id())?;
        self.entries.remove(from);
        let to = self
            .entries
            .partition_point(|e| compare(e, &entry, &self.sort_by) == Ordering::Less);
        self.entries.insert(to, entry);
        self.reindex();
        Some((from, to))
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (i, e) in self.entries.iter().enumerate() {
            self.index.insert(e.room_id().to_string(), i);
        }
    }
}

// =============================================================================
// Filtered list + ops
// =============================================================================

/// One materialized request list: the universe narrowed by the list's
/// filters, in the list's sort order.
#[derive(Debug, Clone, Default)]
struct FilteredSortableRooms {
    rooms: SortableRooms,
    filters: RequestFilters,
}

impl FilteredSortableRooms {
    fn new(list: &RequestList) -> Self {
        Self {
            rooms: SortableRooms::new(list.sort.clone().unwrap_or_default()),
            filters: list.filters.clone().unwrap_or_default(),
        }
    }

    fn materialize(&mut self, universe: &HashMap<String, RoomListEntry>, spaces: &SpaceDescendants) {
        let rooms = universe
            .values()
            .filter(|r| self.filters.include(r, spaces))
            .cloned()
            .collect();
        self.rooms.set_rooms(rooms);
    }

    /// Applies one room update and emits the ops that reshape the tracked
    /// window.
    fn on_room_updated(
        &mut self,
        list: &RequestList,
        entry: &RoomListEntry,
        spaces: &SpaceDescendants,
    ) -> Vec<ResponseOp> {
        let included = self.filters.include(entry, spaces);
        let ranges = list.ranges.clone().unwrap_or_default();
        match (self.rooms.index_of(entry.room_id()), included) {
            (Some(_), true) => {
                let Some((from, to)) = self.rooms.update(entry.clone()) else {
                    return Vec::new();
                };
                let (from, to) = (from as i64, to as i64);
                if from == to {
                    return Vec::new();
                }
                if !ranges.inside(from) {
                    // untracked origin: the delete half is invisible, so the
                    // whole move is
                    return Vec::new();
                }
                match list.calculate_move_indexes(from, to) {
                    Some((f, t)) if f != t => write_swap_op(entry.room_id(), f, t),
                    _ => Vec::new(),
                }
            }
            (Some(_), false) => {
                let Some(from) = self.rooms.remove(entry.room_id()) else {
                    return Vec::new();
                };
                list.write_delete_op(from as i64).into_iter().collect()
            }
            (None, true) => {
                let to = self.rooms.insert(entry.clone()) as i64;
                // a room appearing inside the window pushes the window's last
                // tracked entry out
                match ranges.0.iter().find(|r| r[0] <= to && to <= r[1]) {
                    Some(r) => vec![
                        ResponseOp::Delete { index: r[1] },
                        ResponseOp::Insert {
                            index: to,
                            room_id: entry.room_id().to_string(),
                        },
                    ],
                    None => Vec::new(),
                }
            }
            (None, false) => Vec::new(),
        }
    }
}

// =============================================================================
// Request engine
// =============================================================================

/// Per-connection state: the merged request, the connection's room universe
/// and one materialized list per request list.
#[derive(Debug, Default)]
pub struct RequestEngine {
    muxed: Option<Request>,
    universe: HashMap<String, RoomListEntry>,
    spaces: SpaceDescendants,
    lists: Vec<FilteredSortableRooms>,
}

impl RequestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The merged request currently in force.
    pub fn request(&self) -> Option<&Request> {
        self.muxed.as_ref()
    }

    /// Installs the space descendant index the `spaces` filter consults.
    pub fn set_space_descendants(&mut self, spaces: SpaceDescendants) {
        self.spaces = spaces;
    }

    /// Seeds (or replaces) the connection's room universe and
    /// rematerializes every list.
    pub fn set_rooms(&mut self, rooms: Vec<RoomListEntry>) {
        self.universe = rooms
            .into_iter()
            .map(|r| (r.room_id().to_string(), r))
            .collect();
        for list in &mut self.lists {
            list.materialize(&self.universe, &self.spaces);
        }
    }

    /// Folds a new client request into the connection state. Lists whose
    /// sort order or filters changed (and brand new lists) are
    /// rematerialized from the universe; everything else is kept as-is so
    /// the client's window survives sparse requests untouched.
    pub fn apply_request(&mut self, next: &Request) -> RequestDelta {
        let (merged, delta) = apply_delta(self.muxed.as_ref(), next);
        let mut lists = Vec::with_capacity(merged.lists.len());
        for (i, curr) in merged.lists.iter().enumerate() {
            let prev_list = delta.lists.get(i).and_then(|d| d.prev.as_ref());
            let rebuild = i >= self.lists.len()
                || RequestList::sort_order_changed(prev_list, curr)
                || RequestList::filters_changed(prev_list, curr);
            if rebuild {
                let mut fresh = FilteredSortableRooms::new(curr);
                fresh.materialize(&self.universe, &self.spaces);
                lists.push(fresh);
            } else {
                lists.push(self.lists[i].clone());
            }
        }
        self.lists = lists;
        self.muxed = Some(merged);
        delta
    }

    /// Applies a room update (new activity, membership change, metadata
    /// delta) to the universe and every list. Returns one op stream per
    /// list, index-aligned with the request's lists.
    pub fn on_room_updated(&mut self, entry: RoomListEntry) -> Vec<Vec<ResponseOp>> {
        self.universe
            .insert(entry.room_id().to_string(), entry.clone());
        let Some(muxed) = &self.muxed else {
            return Vec::new();
        };
        let mut all_ops = Vec::with_capacity(self.lists.len());
        for (list, req_list) in self.lists.iter_mut().zip(&muxed.lists) {
            all_ops.push(list.on_room_updated(req_list, &entry, &self.spaces));
        }
        all_ops
    }

    /// Number of rooms matching list `i`'s filters.
    pub fn list_len(&self, i: usize) -> Option<usize> {
        self.lists.get(i).map(|l| l.rooms.len())
    }

    /// The room IDs currently inside list `i`'s tracked ranges, window
    /// order, for response assembly.
    pub fn rooms_in_ranges(&self, i: usize) -> Vec<String> {
        let Some(muxed) = &self.muxed else {
            return Vec::new();
        };
        let (Some(list), Some(req_list)) = (self.lists.get(i), muxed.lists.get(i)) else {
            return Vec::new();
        };
        let ranges = req_list.ranges.clone().unwrap_or_default();
        let mut out = Vec::new();
        for r in &ranges.0 {
            for idx in r[0]..=r[1] {
                if let Some(entry) = list.rooms.entry_at(idx as usize) {
                    out.push(entry.room_id().to_string());
                }
            }
        }
        out
    }

    /// The effective timeline limit for a room in list `i`.
    pub fn timeline_limit(&self, i: usize, room_id: &str) -> i64 {
        self.muxed
            .as_ref()
            .map(|r| r.timeline_limit(i, room_id))
            .unwrap_or(crate::request::DEFAULT_TIMELINE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::SliceRanges;

    fn entry(room_id: &str, ts: u64) -> RoomListEntry {
        let mut metadata = RoomMetadata::new(room_id);
        metadata.last_message_timestamp = ts;
        metadata.join_count = 2;
        RoomListEntry {
            metadata,
            ..Default::default()
        }
    }

    fn recency_engine(ranges: Vec<[i64; 2]>, rooms: Vec<RoomListEntry>) -> RequestEngine {
        let mut engine = RequestEngine::new();
        engine.set_rooms(rooms);
        engine.apply_request(&Request {
            lists: vec![RequestList {
                ranges: Some(SliceRanges(ranges)),
                sort: Some(vec![SORT_BY_RECENCY.to_string()]),
                ..Default::default()
            }],
            ..Default::default()
        });
        engine
    }

    /// Five rooms sorted by recency, window over the top four. A message in
    /// the room at index 3 bumps it to the top.
    #[test]
    fn test_window_move_emits_delete_insert() {
        let rooms = vec![
            entry("!r1:s", 50),
            entry("!r2:s", 40),
            entry("!r3:s", 30),
            entry("!r4:s", 20),
            entry("!r5:s", 10),
        ];
        let mut engine = recency_engine(vec![[0, 3]], rooms);
        assert_eq!(
            engine.rooms_in_ranges(0),
            vec!["!r1:s", "!r2:s", "!r3:s", "!r4:s"]
        );

        let ops = engine.on_room_updated(entry("!r4:s", 60));
        assert_eq!(
            ops[0],
            vec![
                ResponseOp::Delete { index: 3 },
                ResponseOp::Insert {
                    index: 0,
                    room_id: "!r4:s".to_string()
                },
            ]
        );
        assert_eq!(
            engine.rooms_in_ranges(0),
            vec!["!r4:s", "!r1:s", "!r2:s", "!r3:s"]
        );
    }

    /// Same list, but the activity is in the room at index 4, outside the
    /// window: the delete would land at an untracked index, so nothing is
    /// emitted.
    #[test]
    fn test_out_of_window_move_is_invisible() {
        let rooms = vec![
            entry("!r1:s", 50),
            entry("!r2:s", 40),
            entry("!r3:s", 30),
            entry("!r4:s", 20),
            entry("!r5:s", 10),
        ];
        let mut engine = recency_engine(vec![[0, 3]], rooms);
        let ops = engine.on_room_updated(entry("!r5:s", 60));
        assert!(ops[0].is_empty());
    }

    /// A brand new room appearing outside the window emits nothing; inside
    /// the window it pushes the last tracked entry out.
    #[test]
    fn test_new_room_insertion() {
        let rooms = vec![entry("!r1:s", 50), entry("!r2:s", 40), entry("!r3:s", 30)];
        let mut engine = recency_engine(vec![[0, 1]], rooms);

        let ops = engine.on_room_updated(entry("!old:s", 5));
        assert!(ops[0].is_empty(), "outside the window");

        let ops = engine.on_room_updated(entry("!new:s", 60));
        assert_eq!(
            ops[0],
            vec![
                ResponseOp::Delete { index: 1 },
                ResponseOp::Insert {
                    index: 0,
                    room_id: "!new:s".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_filter_change_removes_room_with_delete() {
        let mut encrypted = entry("!enc:s", 50);
        encrypted.metadata.encrypted = true;
        let rooms = vec![encrypted, entry("!plain:s", 40)];
        let mut engine = recency_engine(vec![[0, 1]], rooms);
        assert_eq!(engine.list_len(0), Some(2));

        // an update that flips the room out of the filter emits a DELETE
        engine.apply_request(&Request {
            lists: vec![RequestList {
                filters: Some(RequestFilters {
                    is_encrypted: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(engine.list_len(0), Some(1));

        let mut no_longer_matching = entry("!enc:s", 55);
        no_longer_matching.metadata.encrypted = false;
        // encryption never unlatches in the store; this exercises the list
        // machinery only
        let ops = engine.on_room_updated(no_longer_matching);
        assert_eq!(ops[0], vec![ResponseOp::Delete { index: 0 }]);
        assert_eq!(engine.list_len(0), Some(0));
    }

    #[test]
    fn test_sort_by_name() {
        let mut a = entry("!a:s", 10);
        a.metadata.name_event = "Zebra".to_string();
        let mut b = entry("!b:s", 20);
        b.metadata.name_event = "aardvark".to_string();
        let mut list = SortableRooms::new(vec![SORT_BY_NAME.to_string()]);
        list.set_rooms(vec![a, b]);
        let ids: Vec<&str> = list.room_ids().collect();
        assert_eq!(ids, vec!["!b:s", "!a:s"]);
    }

    #[test]
    fn test_sort_chains_comparators() {
        let mut a = entry("!a:s", 10);
        a.notification_count = 5;
        let mut b = entry("!b:s", 10);
        b.notification_count = 9;
        let mut list = SortableRooms::new(vec![
            SORT_BY_RECENCY.to_string(),
            SORT_BY_NOTIFICATION_COUNT.to_string(),
        ]);
        list.set_rooms(vec![a, b]);
        let ids: Vec<&str> = list.room_ids().collect();
        // same recency, so notification count breaks the tie
        assert_eq!(ids, vec!["!b:s", "!a:s"]);
    }

    #[test]
    fn test_build_space_descendants_is_transitive() {
        let mut metadata = HashMap::new();
        let mut top = RoomMetadata::new("!top:s");
        top.room_type = Some("m.space".to_string());
        top.child_space_rooms.insert("!mid:s".to_string());
        top.child_space_rooms.insert("!roomA:s".to_string());
        let mut mid = RoomMetadata::new("!mid:s");
        mid.room_type = Some("m.space".to_string());
        mid.child_space_rooms.insert("!roomB:s".to_string());
        metadata.insert("!top:s".to_string(), top);
        metadata.insert("!mid:s".to_string(), mid);
        metadata.insert("!roomA:s".to_string(), RoomMetadata::new("!roomA:s"));
        metadata.insert("!roomB:s".to_string(), RoomMetadata::new("!roomB:s"));

        let descendants = build_space_descendants(&metadata);
        assert!(descendants["!top:s"].contains("!roomA:s"));
        assert!(descendants["!top:s"].contains("!roomB:s"), "nested spaces flatten");
        assert!(descendants["!mid:s"].contains("!roomB:s"));
        assert!(!descendants["!mid:s"].contains("!roomA:s"));
    }

    #[test]
    fn test_spaces_filter() {
        let mut spaces = SpaceDescendants::new();
        spaces.insert(
            "!space:s".to_string(),
            ["!inside:s".to_string()].into_iter().collect(),
        );
        let filters = RequestFilters {
            spaces: vec!["!space:s".to_string()],
            ..Default::default()
        };
        assert!(filters.include(&entry("!inside:s", 1), &spaces));
        assert!(!filters.include(&entry("!outside:s", 1), &spaces));
    }

    #[test]
    fn test_tri_state_filters() {
        let mut dm = entry("!dm:s", 1);
        dm.is_dm = true;
        let spaces = SpaceDescendants::new();

        let want_dm = RequestFilters {
            is_dm: Some(true),
            ..Default::default()
        };
        assert!(want_dm.include(&dm, &spaces));
        assert!(!want_dm.include(&entry("!group:s", 1), &spaces));

        let no_dm = RequestFilters {
            is_dm: Some(false),
            ..Default::default()
        };
        assert!(!no_dm.include(&dm, &spaces));

        let mut named = entry("!named:s", 1);
        named.metadata.name_event = "Rust Lounge".to_string();
        let name_filter = RequestFilters {
            room_name_filter: "lounge".to_string(),
            ..Default::default()
        };
        assert!(name_filter.include(&named, &spaces));
        assert!(!name_filter.include(&entry("!anon:s", 1), &spaces));
    }

    #[test]
    fn test_sparse_request_keeps_window() {
        let rooms = vec![entry("!r1:s", 50), entry("!r2:s", 40)];
        let mut engine = recency_engine(vec![[0, 1]], rooms);
        // a sparse follow-up with no list fields set keeps the materialized
        // list intact
        engine.apply_request(&Request {
            lists: vec![RequestList::default()],
            ..Default::default()
        });
        assert_eq!(engine.rooms_in_ranges(0), vec!["!r1:s", "!r2:s"]);
    }
}
