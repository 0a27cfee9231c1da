//! # Client Request Model
//!
//! A connection's view of the world is described by a [`Request`]: a set of
//! positionally-keyed windowed *lists* (ranges, sort order, filter, per-room
//! requirements) plus explicit per-room subscriptions. Clients send sparse
//! requests — any field they omit means "same as last time" — so the engine
//! keeps the previously merged request per connection and folds each new one
//! in with [`apply_delta`], which also reports what actually changed.
//!
//! This module also implements the move-op policy: translating "room moved
//! from absolute index A to absolute index B" into the `DELETE`/`INSERT`
//! pair that reshapes the client's tracked window with minimal disruption.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lists::{RoomListEntry, SpaceDescendants};
use crate::metadata::{calculate_room_name, RequiredStateMap};
use crate::ranges::SliceRanges;

pub const SORT_BY_NAME: &str = "by_name";
pub const SORT_BY_RECENCY: &str = "by_recency";
pub const SORT_BY_NOTIFICATION_COUNT: &str = "by_notification_count";
pub const SORT_BY_HIGHLIGHT_COUNT: &str = "by_highlight_count";

/// Timeline events per room when neither the subscription nor the list says
/// otherwise.
pub const DEFAULT_TIMELINE_LIMIT: i64 = 20;

// =============================================================================
// Request shape
// =============================================================================

/// Per-room requirements, either standalone (a subscription) or embedded in
/// a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSubscription {
    /// `(event_type, state_key)` tuples with `*` wildcards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_state: Option<Vec<[String; 2]>>,
    /// Zero means unset.
    #[serde(default)]
    pub timeline_limit: i64,
}

impl RoomSubscription {
    /// Union of two subscriptions: the larger timeline limit and the
    /// concatenated required-state tuples (the map construction dedups).
    pub fn combine(&self, other: &RoomSubscription) -> RoomSubscription {
        let mut required_state = self.required_state.clone().unwrap_or_default();
        required_state.extend(other.required_state.clone().unwrap_or_default());
        RoomSubscription {
            required_state: if required_state.is_empty() {
                None
            } else {
                Some(required_state)
            },
            timeline_limit: self.timeline_limit.max(other.timeline_limit),
        }
    }

    /// The minimal cover over this subscription's required-state tuples.
    pub fn required_state_map(&self) -> RequiredStateMap {
        RequiredStateMap::from_tuples(self.required_state.iter().flatten())
    }
}

/// Tri-state room predicates plus name and space restrictions. All set
/// predicates must pass for a room to be included.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestFilters {
    /// Restrict to descendants of these space room IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_invite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_tombstoned: Option<bool>,
    /// Case-insensitive substring match on the computed display name.
    #[serde(default, rename = "room_name_like", skip_serializing_if = "String::is_empty")]
    pub room_name_filter: String,
}

impl RequestFilters {
    /// Whether the room passes every set predicate.
    pub fn include(&self, room: &RoomListEntry, spaces: &SpaceDescendants) -> bool {
        if let Some(want) = self.is_encrypted {
            if want != room.metadata.encrypted {
                return false;
            }
        }
        if let Some(want) = self.is_tombstoned {
            if want != room.metadata.upgraded_room_id.is_some() {
                return false;
            }
        }
        if let Some(want) = self.is_dm {
            if want != room.is_dm {
                return false;
            }
        }
        if let Some(want) = self.is_invite {
            if want != room.is_invite {
                return false;
            }
        }
        if !self.room_name_filter.is_empty() {
            let name = calculate_room_name(&room.metadata).to_lowercase();
            if !name.contains(&self.room_name_filter.to_lowercase()) {
                return false;
            }
        }
        if !self.spaces.is_empty() {
            let in_space = self.spaces.iter().any(|space| {
                spaces
                    .get(space)
                    .is_some_and(|descendants| descendants.contains(&room.metadata.room_id))
            });
            if !in_space {
                return false;
            }
        }
        true
    }
}

/// A named windowed view over the room list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestList {
    #[serde(flatten)]
    pub room_subscription: RoomSubscription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranges: Option<SliceRanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<RequestFilters>,
}

impl RequestList {
    fn effective_sort(&self) -> &[String] {
        self.sort.as_deref().unwrap_or(&[])
    }

    fn effective_ranges(&self) -> SliceRanges {
        self.ranges.clone().unwrap_or_default()
    }

    /// Structural comparison of sort orders; a `None` list counts as empty.
    pub fn sort_order_changed(prev: Option<&RequestList>, next: &RequestList) -> bool {
        let prev_sort = prev.map(RequestList::effective_sort).unwrap_or(&[]);
        prev_sort != next.effective_sort()
    }

    /// Canonical-JSON comparison of filters; easier than a field-by-field
    /// walk through the tri-states.
    pub fn filters_changed(prev: Option<&RequestList>, next: &RequestList) -> bool {
        let prev_filters = prev.and_then(|l| l.filters.as_ref());
        serde_json::to_value(prev_filters).ok() != serde_json::to_value(&next.filters).ok()
    }

    /// A delete operation for this list, or `None` for invalid indexes or
    /// indexes this list isn't tracking — a delete at an untracked index is
    /// invisible to the client.
    pub fn write_delete_op(&self, deleted_index: i64) -> Option<ResponseOp> {
        if deleted_index < 0 || !self.effective_ranges().inside(deleted_index) {
            return None;
        }
        Some(ResponseOp::Delete {
            index: deleted_index,
        })
    }

    /// Calculates the real from → to index positions for a move, taking the
    /// list's ranges into account. Returns `None` if the move is invisible,
    /// i.e. both indexes are outside all ranges and the move doesn't jump
    /// over any.
    ///
    /// - Both inside a range: the indexes are used as-is.
    /// - One inside: the inside index is used as-is and the outside one
    ///   snaps to the closest range boundary in the direction of movement.
    /// - Both outside: the boundaries of the first range strictly jumped
    ///   over are used (jumping multiple ranges collapses to the first; a
    ///   known limitation).
    pub fn calculate_move_indexes(&self, from_index: i64, to_index: i64) -> Option<(i64, i64)> {
        let ranges = self.effective_ranges();
        let from_inside = ranges.inside(from_index);
        let to_inside = ranges.inside(to_index);
        if from_inside && to_inside {
            return Some((from_index, to_index));
        }
        if !from_inside && !to_inside {
            let (lo, hi) = if from_index < to_index {
                (from_index, to_index)
            } else {
                (to_index, from_index)
            };
            let jumped = ranges
                .0
                .iter()
                .find(|r| r[0] > lo && r[0] < hi && r[1] > lo && r[1] < hi)?;
            return if from_index > to_index {
                // heading towards zero
                Some((jumped[1], jumped[0]))
            } else {
                Some((jumped[0], jumped[1]))
            };
        }
        if from_inside {
            let to = ranges.closest_in_direction(to_index, to_index > from_index);
            Some((from_index, to))
        } else {
            let from = ranges.closest_in_direction(from_index, to_index < from_index);
            Some((from, to_index))
        }
    }
}

/// Moves a room between two absolute index positions: 0 ops when the
/// positions coincide, else a `DELETE` at the old index and an `INSERT` at
/// the new one.
pub fn write_swap_op(room_id: &str, from_index: i64, to_index: i64) -> Vec<ResponseOp> {
    if from_index == to_index {
        return Vec::new();
    }
    vec![
        ResponseOp::Delete { index: from_index },
        ResponseOp::Insert {
            index: to_index,
            room_id: room_id.to_string(),
        },
    ]
}

/// An instruction moving the server-side view of a list into its new shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ResponseOp {
    #[serde(rename = "DELETE")]
    Delete { index: i64 },
    #[serde(rename = "INSERT")]
    Insert { index: i64, room_id: String },
}

/// A client's full view description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lists: Vec<RequestList>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub room_subscriptions: HashMap<String, RoomSubscription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unsubscribe_rooms: Vec<String>,
}

impl Request {
    /// The timeline limit for a room in a list: per-room subscription
    /// overrides per-list, which overrides the default.
    pub fn timeline_limit(&self, list_index: usize, room_id: &str) -> i64 {
        if let Some(sub) = self.room_subscriptions.get(room_id) {
            if sub.timeline_limit > 0 {
                return sub.timeline_limit;
            }
        }
        if let Some(list) = self.lists.get(list_index) {
            if list.room_subscription.timeline_limit > 0 {
                return list.room_subscription.timeline_limit;
            }
        }
        DEFAULT_TIMELINE_LIMIT
    }
}

// =============================================================================
// Request diffing
// =============================================================================

/// The diff between two successive requests.
#[derive(Debug, Clone, Default)]
pub struct RequestDelta {
    /// Room IDs newly subscribed to.
    pub subs: Vec<String>,
    /// Room IDs unsubscribed from.
    pub unsubs: Vec<String>,
    /// One entry per list position across both requests.
    pub lists: Vec<RequestListDelta>,
}

/// What one list position looked like before and after the merge.
#[derive(Debug, Clone, Default)]
pub struct RequestListDelta {
    pub prev: Option<RequestList>,
    pub curr: Option<RequestList>,
}

/// Merges `next` on top of `prev` (None for the connection's first request):
/// per list position and per field, the new value wins if present, else the
/// previous one sticks. Subscriptions merge as
/// `(prev_subs ∖ prev_unsubs) ∪ new_subs ∖ new_unsubs`; a room in both
/// `new_subs` and `new_unsubs` resolves to unsubscribed and is not reported
/// as a new subscription.
pub fn apply_delta(prev: Option<&Request>, next: &Request) -> (Request, RequestDelta) {
    let empty = Request::default();
    let prev = prev.unwrap_or(&empty);
    let mut delta = RequestDelta::default();

    let mut lists = Vec::with_capacity(next.lists.len());
    for (i, next_list) in next.lists.iter().enumerate() {
        let mut next_list = next_list.clone();
        let Some(existing) = prev.lists.get(i) else {
            // a brand new list defaults to recency sort
            if next_list.sort.is_none() {
                next_list.sort = Some(vec![SORT_BY_RECENCY.to_string()]);
            }
            lists.push(next_list);
            continue;
        };
        lists.push(RequestList {
            ranges: next_list.ranges.or_else(|| existing.ranges.clone()),
            sort: next_list.sort.or_else(|| existing.sort.clone()),
            filters: next_list.filters.or_else(|| existing.filters.clone()),
            room_subscription: RoomSubscription {
                required_state: next_list
                    .room_subscription
                    .required_state
                    .or_else(|| existing.room_subscription.required_state.clone()),
                timeline_limit: if next_list.room_subscription.timeline_limit == 0 {
                    existing.room_subscription.timeline_limit
                } else {
                    next_list.room_subscription.timeline_limit
                },
            },
        });
    }

    // the delta spans the longest of the two list sets
    let max_len = lists.len().max(prev.lists.len());
    delta.lists = (0..max_len)
        .map(|i| RequestListDelta {
            prev: prev.lists.get(i).cloned(),
            curr: lists.get(i).cloned(),
        })
        .collect();

    // Subscriptions are applied as:
    //   prev.subs -> prev.unsubs (normally empty) -> next.subs -> next.unsubs
    let mut result_subs = prev.room_subscriptions.clone();
    for room_id in &prev.unsubscribe_rooms {
        if result_subs.remove(room_id).is_some() {
            delta.unsubs.push(room_id.clone());
        }
    }
    for (room_id, sub) in &next.room_subscriptions {
        result_subs.insert(room_id.clone(), sub.clone());
    }
    for room_id in &next.unsubscribe_rooms {
        if result_subs.contains_key(room_id) {
            // subscribing and unsubscribing in the same request nets out to
            // unsubscribed without reporting an unsub
            if !next.room_subscriptions.contains_key(room_id) {
                delta.unsubs.push(room_id.clone());
            }
        }
        result_subs.remove(room_id);
    }
    for room_id in result_subs.keys() {
        if !prev.room_subscriptions.contains_key(room_id) {
            delta.subs.push(room_id.clone());
        }
    }

    let merged = Request {
        lists,
        room_subscriptions: result_subs,
        unsubscribe_rooms: Vec::new(),
    };
    (merged, delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_ranges(ranges: Vec<[i64; 2]>) -> RequestList {
        RequestList {
            ranges: Some(SliceRanges(ranges)),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_delta_is_idempotent() {
        let mut req = Request {
            lists: vec![RequestList {
                ranges: Some(SliceRanges(vec![[0, 19]])),
                sort: Some(vec![SORT_BY_RECENCY.to_string()]),
                filters: Some(RequestFilters {
                    is_dm: Some(false),
                    ..Default::default()
                }),
                room_subscription: RoomSubscription {
                    required_state: Some(vec![["m.room.name".to_string(), String::new()]]),
                    timeline_limit: 10,
                },
            }],
            ..Default::default()
        };
        req.room_subscriptions.insert(
            "!sub:s".to_string(),
            RoomSubscription {
                timeline_limit: 50,
                ..Default::default()
            },
        );

        let (merged, delta) = apply_delta(Some(&req), &req);
        assert_eq!(merged, req);
        assert!(delta.subs.is_empty());
        assert!(delta.unsubs.is_empty());
        assert_eq!(delta.lists.len(), 1);
        assert!(!RequestList::sort_order_changed(
            delta.lists[0].prev.as_ref(),
            delta.lists[0].curr.as_ref().unwrap()
        ));
        assert!(!RequestList::filters_changed(
            delta.lists[0].prev.as_ref(),
            delta.lists[0].curr.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_apply_delta_sticky_fields() {
        let first = Request {
            lists: vec![RequestList {
                ranges: Some(SliceRanges(vec![[0, 9]])),
                sort: Some(vec![SORT_BY_NAME.to_string()]),
                filters: Some(RequestFilters {
                    is_encrypted: Some(true),
                    ..Default::default()
                }),
                room_subscription: RoomSubscription {
                    timeline_limit: 5,
                    ..Default::default()
                },
            }],
            ..Default::default()
        };
        let (merged, _) = apply_delta(None, &first);

        // a sparse follow-up only changes the ranges
        let sparse = Request {
            lists: vec![list_with_ranges(vec![[0, 4]])],
            ..Default::default()
        };
        let (merged, delta) = apply_delta(Some(&merged), &sparse);
        let list = &merged.lists[0];
        assert_eq!(list.ranges, Some(SliceRanges(vec![[0, 4]])));
        assert_eq!(list.sort, Some(vec![SORT_BY_NAME.to_string()]));
        assert_eq!(list.filters.as_ref().unwrap().is_encrypted, Some(true));
        assert_eq!(list.room_subscription.timeline_limit, 5);
        assert!(!RequestList::sort_order_changed(
            delta.lists[0].prev.as_ref(),
            delta.lists[0].curr.as_ref().unwrap()
        ));
    }

    #[test]
    fn test_apply_delta_defaults_new_list_to_recency() {
        let first = Request {
            lists: vec![list_with_ranges(vec![[0, 9]])],
            ..Default::default()
        };
        let (merged, _) = apply_delta(None, &first);
        assert_eq!(merged.lists[0].sort, Some(vec![SORT_BY_RECENCY.to_string()]));
    }

    #[test]
    fn test_apply_delta_subscription_merge() {
        let mut prev = Request::default();
        prev.room_subscriptions
            .insert("!a:s".to_string(), RoomSubscription::default());

        let mut next = Request::default();
        next.room_subscriptions
            .insert("!b:s".to_string(), RoomSubscription::default());
        next.unsubscribe_rooms.push("!a:s".to_string());

        let (merged, delta) = apply_delta(Some(&prev), &next);
        assert_eq!(delta.subs, vec!["!b:s".to_string()]);
        assert_eq!(delta.unsubs, vec!["!a:s".to_string()]);
        assert!(merged.room_subscriptions.contains_key("!b:s"));
        assert!(!merged.room_subscriptions.contains_key("!a:s"));
        assert!(merged.unsubscribe_rooms.is_empty());
    }

    #[test]
    fn test_apply_delta_sub_and_unsub_same_room() {
        let mut next = Request::default();
        next.room_subscriptions
            .insert("!x:s".to_string(), RoomSubscription::default());
        next.unsubscribe_rooms.push("!x:s".to_string());

        let (merged, delta) = apply_delta(None, &next);
        assert!(delta.subs.is_empty());
        assert!(delta.unsubs.is_empty());
        assert!(!merged.room_subscriptions.contains_key("!x:s"));
    }

    #[test]
    fn test_move_indexes_both_inside() {
        let list = list_with_ranges(vec![[0, 10]]);
        assert_eq!(list.calculate_move_indexes(3, 0), Some((3, 0)));
        // from == to is a no-op at the swap level
        assert_eq!(list.calculate_move_indexes(5, 5), Some((5, 5)));
        assert!(write_swap_op("!r:s", 5, 5).is_empty());
    }

    #[test]
    fn test_move_indexes_one_inside() {
        let list = list_with_ranges(vec![[1, 4], [7, 9]]);
        // from inside, to outside moving away from zero: snap to towards-zero
        // boundary of the direction of movement
        assert_eq!(list.calculate_move_indexes(3, 12), Some((3, 9)));
        // from inside, to outside moving towards zero
        assert_eq!(list.calculate_move_indexes(3, 0), Some((3, 1)));
        // from outside, to inside moving towards zero
        assert_eq!(list.calculate_move_indexes(12, 8), Some((9, 8)));
        // from outside, to inside moving away from zero
        assert_eq!(list.calculate_move_indexes(0, 2), Some((1, 2)));
    }

    #[test]
    fn test_move_indexes_both_outside() {
        let list = list_with_ranges(vec![[2, 4]]);
        // no range jumped over: invisible
        assert_eq!(list.calculate_move_indexes(5, 6), None);
        // jumping the range towards zero uses (hi, lo)
        assert_eq!(list.calculate_move_indexes(6, 0), Some((4, 2)));
        // jumping the range away from zero uses (lo, hi)
        assert_eq!(list.calculate_move_indexes(0, 6), Some((2, 4)));
    }

    #[test]
    fn test_move_indexes_multiple_jumped_ranges_uses_first() {
        let list = list_with_ranges(vec![[2, 3], [5, 6]]);
        assert_eq!(list.calculate_move_indexes(0, 8), Some((2, 3)));
        assert_eq!(list.calculate_move_indexes(8, 0), Some((3, 2)));
    }

    #[test]
    fn test_write_delete_op_boundaries() {
        let list = list_with_ranges(vec![[0, 2]]);
        assert!(list.write_delete_op(-1).is_none());
        assert!(list.write_delete_op(3).is_none());
        let wider = list_with_ranges(vec![[0, 5]]);
        assert_eq!(wider.write_delete_op(3), Some(ResponseOp::Delete { index: 3 }));
    }

    #[test]
    fn test_write_swap_op() {
        let ops = write_swap_op("!r:s", 3, 0);
        assert_eq!(
            ops,
            vec![
                ResponseOp::Delete { index: 3 },
                ResponseOp::Insert {
                    index: 0,
                    room_id: "!r:s".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_timeline_limit_resolution() {
        let mut req = Request {
            lists: vec![RequestList {
                room_subscription: RoomSubscription {
                    timeline_limit: 7,
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(req.timeline_limit(0, "!r:s"), 7);
        req.room_subscriptions.insert(
            "!r:s".to_string(),
            RoomSubscription {
                timeline_limit: 3,
                ..Default::default()
            },
        );
        assert_eq!(req.timeline_limit(0, "!r:s"), 3);
        assert_eq!(req.timeline_limit(0, "!other:s"), 7);
        req.lists[0].room_subscription.timeline_limit = 0;
        assert_eq!(req.timeline_limit(0, "!other:s"), DEFAULT_TIMELINE_LIMIT);
    }

    #[test]
    fn test_sort_and_filters_changed() {
        let a = RequestList {
            sort: Some(vec![SORT_BY_RECENCY.to_string()]),
            ..Default::default()
        };
        let b = RequestList {
            sort: Some(vec![SORT_BY_NAME.to_string()]),
            ..Default::default()
        };
        assert!(RequestList::sort_order_changed(Some(&a), &b));
        assert!(!RequestList::sort_order_changed(Some(&a), &a));
        assert!(RequestList::sort_order_changed(None, &a));

        let filtered = RequestList {
            filters: Some(RequestFilters {
                is_invite: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(RequestList::filters_changed(Some(&a), &filtered));
        assert!(!RequestList::filters_changed(Some(&filtered), &filtered));
    }

    #[test]
    fn test_subscription_combine() {
        let a = RoomSubscription {
            required_state: Some(vec![["m.room.name".to_string(), String::new()]]),
            timeline_limit: 5,
        };
        let b = RoomSubscription {
            required_state: Some(vec![["m.room.member".to_string(), "*".to_string()]]),
            timeline_limit: 20,
        };
        let combined = a.combine(&b);
        assert_eq!(combined.timeline_limit, 20);
        assert_eq!(combined.required_state.unwrap().len(), 2);
    }

    #[test]
    fn test_response_op_serialization() {
        let del = serde_json::to_value(ResponseOp::Delete { index: 3 }).unwrap();
        assert_eq!(del["op"], "DELETE");
        assert_eq!(del["index"], 3);
        let ins = serde_json::to_value(ResponseOp::Insert {
            index: 0,
            room_id: "!r:s".to_string(),
        })
        .unwrap();
        assert_eq!(ins["op"], "INSERT");
        assert_eq!(ins["room_id"], "!r:s");
    }
}
