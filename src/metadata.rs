//! # Room Metadata
//!
//! User-independent facts about a room, assembled by the global snapshot and
//! kept current by callers as deltas arrive: counts, last activity, explicit
//! name / canonical alias, hero members for name synthesis, room-structure
//! flags and space children. Also home to [`RequiredStateMap`], the minimal
//! cover over a client's requested `(event_type, state_key)` tuples.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::ROOM_TYPE_SPACE;

/// How many heroes a display name draws on.
const MAX_NAME_HEROES: usize = 5;

/// NID and timestamp of the latest event of some type in a room.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    pub nid: i64,
    pub timestamp: u64,
}

/// One of up to six recently-joined-or-invited members, used to synthesise a
/// display name for rooms with no explicit name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hero {
    pub user_id: String,
    pub display_name: String,
}

/// Everything the request engine needs to know about a room, independent of
/// any particular user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    /// Content of the `m.room.name` state event, empty when unset.
    pub name_event: String,
    /// Content of the `m.room.canonical_alias` state event, empty when unset.
    pub canonical_alias: String,
    /// Most recent joined/invited members, newest first, deduplicated by
    /// target user. The upstream spec is ambiguous between forward and
    /// backward stream order here; we pick the most recent six and that
    /// choice is deliberate and documented.
    pub heroes: Vec<Hero>,
    pub join_count: usize,
    pub invite_count: usize,
    /// `origin_server_ts` of the room's most recent event.
    pub last_message_timestamp: u64,
    /// Latest event per event type, keyed by type.
    pub latest_events_by_type: HashMap<String, EventMetadata>,
    pub encrypted: bool,
    pub upgraded_room_id: Option<String>,
    pub predecessor_room_id: Option<String>,
    pub room_type: Option<String>,
    /// Children asserted via `m.space.child`, only populated for spaces.
    pub child_space_rooms: HashSet<String>,
}

impl RoomMetadata {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_space(&self) -> bool {
        self.room_type.as_deref() == Some(ROOM_TYPE_SPACE)
    }
}

/// Computes the display name for a room: the explicit name if set, else the
/// canonical alias, else a name synthesised from up to `MAX_NAME_HEROES`
/// heroes ("Alice", "Alice and Bob", "Alice, Bob and 3 others", ...).
pub fn calculate_room_name(metadata: &RoomMetadata) -> String {
    if !metadata.name_event.is_empty() {
        return metadata.name_event.clone();
    }
    if !metadata.canonical_alias.is_empty() {
        return metadata.canonical_alias.clone();
    }
    let names: Vec<&str> = metadata
        .heroes
        .iter()
        .take(MAX_NAME_HEROES)
        .map(|h| {
            if h.display_name.is_empty() {
                h.user_id.as_str()
            } else {
                h.display_name.as_str()
            }
        })
        .collect();
    // member counts include the requesting user, so "just me" is 1
    let member_count = metadata.join_count + metadata.invite_count;
    if member_count <= 1 {
        return if names.is_empty() {
            "Empty Room".to_string()
        } else {
            format!("Empty Room (was {})", join_names(&names))
        };
    }
    if names.is_empty() {
        return "Empty Room".to_string();
    }
    let others = member_count.saturating_sub(1).saturating_sub(names.len());
    if others > 0 {
        format!("{} and {} others", names.join(", "), others)
    } else {
        join_names(&names)
    }
}

fn join_names(names: &[&str]) -> String {
    match names {
        [] => String::new(),
        [only] => (*only).to_string(),
        [rest @ .., last] => format!("{} and {}", rest.join(", "), last),
    }
}

// =============================================================================
// Required state
// =============================================================================

/// The minimal cover over a client's `(event_type, state_key)` tuples, with
/// `*` wildcards on either side.
///
/// Dominance: `(*,*)` encompasses everything; `(T,*)` encompasses any
/// `(T, k)`; `(*, K)` encompasses any `(t, K)`. Dominated tuples are dropped
/// at construction so [`RequiredStateMap::query_state_map`] hands the
/// storage layer the smallest filter that still covers the request.
#[derive(Debug, Clone, Default)]
pub struct RequiredStateMap {
    all_state: bool,
    event_types_with_wildcard_keys: HashSet<String>,
    state_keys_for_wildcard_type: Vec<String>,
    event_type_to_state_keys: HashMap<String, Vec<String>>,
}

impl RequiredStateMap {
    /// Builds the minimal cover from raw `(event_type, state_key)` tuples.
    pub fn from_tuples<'a>(tuples: impl IntoIterator<Item = &'a [String; 2]> + Clone) -> Self {
        let mut map = RequiredStateMap::default();
        // first pass: wildcards, since they decide what else survives
        for [ev_type, state_key] in tuples.clone() {
            match (ev_type.as_str(), state_key.as_str()) {
                ("*", "*") => {
                    map.all_state = true;
                    return map;
                }
                ("*", key) => map.state_keys_for_wildcard_type.push(key.to_string()),
                (t, "*") => {
                    map.event_types_with_wildcard_keys.insert(t.to_string());
                }
                _ => {}
            }
        }
        for [ev_type, state_key] in tuples {
            if ev_type == "*" || state_key == "*" {
                continue;
            }
            if map.event_types_with_wildcard_keys.contains(ev_type) {
                continue; // dominated by (T, *)
            }
            if map.state_keys_for_wildcard_type.iter().any(|k| k == state_key) {
                continue; // dominated by (*, K)
            }
            map.event_type_to_state_keys
                .entry(ev_type.clone())
                .or_default()
                .push(state_key.clone());
        }
        map
    }

    /// Whether a state event of the given type/key is requested.
    pub fn include(&self, event_type: &str, state_key: &str) -> bool {
        if self.all_state {
            return true;
        }
        if self.state_keys_for_wildcard_type.iter().any(|k| k == state_key) {
            return true;
        }
        if self.event_types_with_wildcard_keys.contains(event_type) {
            return true;
        }
        self.event_type_to_state_keys
            .get(event_type)
            .is_some_and(|keys| keys.iter().any(|k| k == state_key))
    }

    /// The filter handed to the state-after-position query: event type →
    /// state keys, where an empty key list means "all keys for this type"
    /// and an empty map means "all state".
    ///
    /// A `(*, K)` tuple cannot be expressed as a typed filter, so its
    /// presence widens the query to all state; [`RequiredStateMap::include`]
    /// then narrows the result in memory.
    pub fn query_state_map(&self) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        if self.all_state || !self.state_keys_for_wildcard_type.is_empty() {
            return out;
        }
        for (ev_type, keys) in &self.event_type_to_state_keys {
            out.insert(ev_type.clone(), keys.clone());
        }
        for ev_type in &self.event_types_with_wildcard_keys {
            out.insert(ev_type.clone(), Vec::new());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(t: &str, k: &str) -> [String; 2] {
        [t.to_string(), k.to_string()]
    }

    #[test]
    fn test_wildcard_key_dominates_specific_key() {
        // ("m.room.member", "*") + ("m.room.member", "@alice") resolves to
        // just the wildcard
        let tuples = vec![tuple("m.room.member", "*"), tuple("m.room.member", "@alice")];
        let map = RequiredStateMap::from_tuples(&tuples);
        let query = map.query_state_map();
        assert_eq!(query.len(), 1);
        assert_eq!(query["m.room.member"], Vec::<String>::new());
        assert!(map.include("m.room.member", "@alice"));
        assert!(map.include("m.room.member", "@bob"));
        assert!(!map.include("m.room.name", ""));
    }

    #[test]
    fn test_all_state_dominates_everything() {
        let tuples = vec![tuple("*", "*"), tuple("m.room.member", "@alice")];
        let map = RequiredStateMap::from_tuples(&tuples);
        assert!(map.query_state_map().is_empty());
        assert!(map.include("anything", "at all"));
    }

    #[test]
    fn test_wildcard_type_widens_query_but_narrows_in_memory() {
        let tuples = vec![tuple("*", "@alice"), tuple("m.room.name", "")];
        let map = RequiredStateMap::from_tuples(&tuples);
        // (*, K) cannot be queried by type; the filter widens to all state
        assert!(map.query_state_map().is_empty());
        assert!(map.include("m.room.member", "@alice"));
        assert!(map.include("m.room.power_levels", "@alice"));
        assert!(map.include("m.room.name", ""));
        assert!(!map.include("m.room.member", "@bob"));
    }

    #[test]
    fn test_specific_tuples_pass_through() {
        let tuples = vec![tuple("m.room.name", ""), tuple("m.room.member", "@alice")];
        let map = RequiredStateMap::from_tuples(&tuples);
        let query = map.query_state_map();
        assert_eq!(query["m.room.name"], vec![String::new()]);
        assert_eq!(query["m.room.member"], vec!["@alice".to_string()]);
        assert!(map.include("m.room.member", "@alice"));
        assert!(!map.include("m.room.member", "@bob"));
    }

    #[test]
    fn test_room_name_prefers_explicit_name() {
        let mut m = RoomMetadata::new("!r:s");
        m.name_event = "Ops".to_string();
        m.canonical_alias = "#ops:s".to_string();
        assert_eq!(calculate_room_name(&m), "Ops");
        m.name_event.clear();
        assert_eq!(calculate_room_name(&m), "#ops:s");
    }

    #[test]
    fn test_room_name_from_heroes() {
        let mut m = RoomMetadata::new("!r:s");
        m.join_count = 3;
        m.heroes = vec![
            Hero {
                user_id: "@a:s".to_string(),
                display_name: "Alice".to_string(),
            },
            Hero {
                user_id: "@b:s".to_string(),
                display_name: String::new(),
            },
        ];
        assert_eq!(calculate_room_name(&m), "Alice and @b:s");

        m.join_count = 10;
        assert_eq!(calculate_room_name(&m), "Alice, @b:s and 7 others");
    }

    #[test]
    fn test_room_name_empty_room() {
        let mut m = RoomMetadata::new("!r:s");
        m.join_count = 1;
        assert_eq!(calculate_room_name(&m), "Empty Room");
        m.heroes = vec![Hero {
            user_id: "@gone:s".to_string(),
            display_name: "Gone".to_string(),
        }];
        assert_eq!(calculate_room_name(&m), "Empty Room (was Gone)");
    }

    #[test]
    fn test_is_space() {
        let mut m = RoomMetadata::new("!r:s");
        assert!(!m.is_space());
        m.room_type = Some("m.space".to_string());
        assert!(m.is_space());
    }
}
