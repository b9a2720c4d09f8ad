use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Layout of a job's resume position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointShape {
    /// Single running index (word index, artist index).
    Offset,
    /// Outer/inner index pair (song index + word index within the song).
    Nested,
}

impl fmt::Display for CheckpointShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointShape::Offset => write!(f, "offset"),
            CheckpointShape::Nested => write!(f, "nested"),
        }
    }
}

/// Position of the next unit to process.
///
/// Positions of the same shape are totally ordered; positions of different
/// shapes are incomparable and `partial_cmp` returns `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Checkpoint {
    Offset { index: u64 },
    Nested { outer: u64, inner: u64 },
}

impl Checkpoint {
    pub fn offset(index: u64) -> Self {
        Checkpoint::Offset { index }
    }

    pub fn nested(outer: u64, inner: u64) -> Self {
        Checkpoint::Nested { outer, inner }
    }

    /// The first position of a shape.
    pub fn origin(shape: CheckpointShape) -> Self {
        match shape {
            CheckpointShape::Offset => Checkpoint::offset(0),
            CheckpointShape::Nested => Checkpoint::nested(0, 0),
        }
    }

    pub fn shape(&self) -> CheckpointShape {
        match self {
            Checkpoint::Offset { .. } => CheckpointShape::Offset,
            Checkpoint::Nested { .. } => CheckpointShape::Nested,
        }
    }

    /// True when `self` lies strictly before `other`. Mismatched shapes are
    /// never behind each other.
    pub fn is_behind(&self, other: &Checkpoint) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Less))
    }

    /// The later of two same-shaped positions; `self` when shapes differ.
    pub fn furthest(self, other: Checkpoint) -> Checkpoint {
        if self.is_behind(&other) {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Checkpoint::Offset { index: a }, Checkpoint::Offset { index: b }) => Some(a.cmp(b)),
            (
                Checkpoint::Nested {
                    outer: ao,
                    inner: ai,
                },
                Checkpoint::Nested {
                    outer: bo,
                    inner: bi,
                },
            ) => Some((ao, ai).cmp(&(bo, bi))),
            _ => None,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checkpoint::Offset { index } => write!(f, "{}", index),
            Checkpoint::Nested { outer, inner } => write!(f, "{}:{}", outer, inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_orders_outer_first() {
        assert!(Checkpoint::nested(1, 40).is_behind(&Checkpoint::nested(2, 0)));
        assert!(Checkpoint::nested(2, 0).is_behind(&Checkpoint::nested(2, 1)));
        assert!(!Checkpoint::nested(2, 1).is_behind(&Checkpoint::nested(2, 1)));
    }

    #[test]
    fn mismatched_shapes_are_incomparable() {
        let a = Checkpoint::offset(5);
        let b = Checkpoint::nested(0, 0);
        assert_eq!(a.partial_cmp(&b), None);
        assert!(!a.is_behind(&b));
        assert!(!b.is_behind(&a));
        assert_eq!(a.furthest(b), a);
    }

    #[test]
    fn furthest_picks_later_position() {
        assert_eq!(
            Checkpoint::offset(10).furthest(Checkpoint::offset(50)),
            Checkpoint::offset(50)
        );
        assert_eq!(
            Checkpoint::offset(50).furthest(Checkpoint::offset(10)),
            Checkpoint::offset(50)
        );
    }

    #[test]
    fn serializes_as_tagged_object() {
        let json = serde_json::to_value(Checkpoint::nested(3, 12)).unwrap();
        assert_eq!(json["kind"], "nested");
        assert_eq!(json["outer"], 3);
        assert_eq!(json["inner"], 12);

        let back: Checkpoint = serde_json::from_str(r#"{"kind":"offset","index":50}"#).unwrap();
        assert_eq!(back, Checkpoint::offset(50));
    }
}
