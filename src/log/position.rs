use bytes::Bytes;
use std::fmt;

/// Position is a monotonic sequence number identifying one slot in the log.
/// Callers never build one from a raw integer; positions only come out of
/// operations (`beginning`, `ending`, `read`, `append`, `truncate`, election)
/// and go back in for comparison and range selection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Position(u64);

impl Position {
    pub(crate) fn new(value: u64) -> Self {
        Position(value)
    }

    pub(crate) fn value(&self) -> u64 {
        self.0
    }

    /// Number of positions between `earlier` and `self`, saturating at zero
    /// when `earlier` is actually ahead.
    pub fn distance(&self, earlier: &Position) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry is one client-visible append record: the position it was decided at
/// and the bytes the writer appended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub position: Position,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_ordering() {
        assert!(Position::new(1) < Position::new(2));
        assert_eq!(Position::new(7), Position::new(7));
        assert!(Position::new(10) > Position::new(9));
    }

    #[test]
    fn position_distance_saturates() {
        let near = Position::new(3);
        let far = Position::new(10);
        assert_eq!(far.distance(&near), 7);
        assert_eq!(near.distance(&far), 0);
        assert_eq!(near.distance(&near), 0);
    }

    #[test]
    fn position_display_is_raw_value() {
        assert_eq!(format!("{}", Position::new(42)), "42");
    }
}
