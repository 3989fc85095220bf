//! Discard points: "everything before event number N may be removed".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position in a stream before which events may be discarded.
///
/// Ordered by the first event number kept, so combining two points with
/// [`DiscardPoint::or`] keeps the more restrictive one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiscardPoint {
    first_event_number_to_keep: i64,
}

impl DiscardPoint {
    pub const KEEP_ALL: DiscardPoint = DiscardPoint {
        first_event_number_to_keep: 0,
    };

    pub fn discard_before(event_number: i64) -> Self {
        Self {
            first_event_number_to_keep: event_number.max(0),
        }
    }

    pub fn discard_including(event_number: i64) -> Self {
        Self::discard_before(event_number.saturating_add(1))
    }

    pub fn first_event_number_to_keep(&self) -> i64 {
        self.first_event_number_to_keep
    }

    pub fn is_keep_all(&self) -> bool {
        *self == Self::KEEP_ALL
    }

    pub fn should_discard(&self, event_number: i64) -> bool {
        event_number < self.first_event_number_to_keep
    }

    /// Most restrictive of the two points
    pub fn or(self, other: DiscardPoint) -> DiscardPoint {
        self.max(other)
    }
}

impl Default for DiscardPoint {
    fn default() -> Self {
        Self::KEEP_ALL
    }
}

impl fmt::Display for DiscardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_keep_all() {
            write!(f, "Keep all")
        } else {
            write!(f, "Discard before {}", self.first_event_number_to_keep)
        }
    }
}
