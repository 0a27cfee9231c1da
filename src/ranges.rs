//! # Window Ranges
//!
//! A client list tracks one or more index ranges over the sorted room list,
//! e.g. `[[0,19]]` for "the top twenty" or `[[0,9],[100,109]]` for a window
//! plus a preloaded page. Ranges are inclusive on both ends, sorted and
//! non-overlapping. Move-op computation needs two primitives: membership
//! (`inside`) and boundary snapping (`closest_in_direction`).

use serde::{Deserialize, Serialize};

/// Inclusive `[lo, hi]` index ranges, sorted and non-overlapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SliceRanges(pub Vec<[i64; 2]>);

impl SliceRanges {
    /// True when every range is well-formed (`lo <= hi`, non-negative) and
    /// ranges are sorted without overlap.
    pub fn valid(&self) -> bool {
        let mut prev_hi: i64 = -1;
        for r in &self.0 {
            if r[0] < 0 || r[1] < r[0] {
                return false;
            }
            if r[0] <= prev_hi {
                return false;
            }
            prev_hi = r[1];
        }
        true
    }

    /// Whether `i` falls inside any range.
    pub fn inside(&self, i: i64) -> bool {
        self.0.iter().any(|r| r[0] <= i && i <= r[1])
    }

    /// The range boundary closest to `i` heading towards zero (or away from
    /// it), or -1 when no boundary lies in that direction. Used to snap an
    /// untracked index onto the window edge it moved past.
    pub fn closest_in_direction(&self, i: i64, towards_zero: bool) -> i64 {
        let mut closest = -1;
        for r in &self.0 {
            for bound in [r[0], r[1]] {
                if towards_zero {
                    if bound <= i && bound > closest {
                        closest = bound;
                    }
                } else if bound >= i && (closest == -1 || bound < closest) {
                    closest = bound;
                }
            }
        }
        closest
    }

    /// Total number of tracked indexes across all ranges.
    pub fn size(&self) -> i64 {
        self.0.iter().map(|r| r[1] - r[0] + 1).sum()
    }
}

impl From<Vec<[i64; 2]>> for SliceRanges {
    fn from(v: Vec<[i64; 2]>) -> Self {
        Self(v)
    }
}
