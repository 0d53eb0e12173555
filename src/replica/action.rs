use bytes::Bytes;
use std::fmt;

/// Ballot is a proposal number: a round paired with a per-coordinator salt so
/// that two coordinators proposing in the same round are still totally
/// ordered. Derived ordering is lexicographic, which is exactly the order we
/// want (round first, salt as tiebreak).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Ballot {
    pub(crate) round: u64,
    pub(crate) salt: u64,
}

impl Ballot {
    pub(crate) fn zero() -> Self {
        Ballot { round: 0, salt: 0 }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.round, self.salt)
    }
}

/// ActionKind is what was decided at a log position. Only appends surface to
/// readers as entries; truncates and nops occupy positions all the same.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ActionKind {
    Append(Bytes),
    Truncate(u64),
    Nop,
}

/// Action is the replica-level record at one position. `performed` means the
/// slot holds an accepted value; `learned` means consensus on it is decided.
/// Readers only ever see actions that are both.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Action {
    pub(crate) position: u64,
    pub(crate) ballot: Ballot,
    pub(crate) performed: bool,
    pub(crate) learned: bool,
    pub(crate) kind: ActionKind,
}

impl Action {
    pub(crate) fn accepted(position: u64, ballot: Ballot, kind: ActionKind) -> Self {
        Action {
            position,
            ballot,
            performed: true,
            learned: false,
            kind,
        }
    }
}
