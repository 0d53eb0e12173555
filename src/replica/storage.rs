use crate::replica::action::{Action, ActionKind, Ballot};
use std::collections::BTreeMap;
use std::io;

/// LogStorage is the replica's persistence seam. The replica actor owns one
/// and funnels every state change through it, so swapping in an on-disk
/// implementation later only touches this trait.
pub(crate) trait LogStorage: Send + 'static {
    fn promised(&self) -> Ballot;

    fn store_promised(&mut self, ballot: Ballot) -> Result<(), io::Error>;

    /// Earliest readable position.
    fn beginning(&self) -> u64;

    /// Advances the beginning and discards every action before it.
    fn store_beginning(&mut self, position: u64) -> Result<(), io::Error>;

    /// One past the highest learned position; zero for a virgin log.
    fn ending(&self) -> u64;

    fn action(&self, position: u64) -> Result<Option<Action>, io::Error>;

    fn store_action(&mut self, action: Action) -> Result<(), io::Error>;

    /// Every stored action with position in `[from, to]`, ascending,
    /// including ones that are not yet learned.
    fn actions(&self, from: u64, to: u64) -> Result<Vec<Action>, io::Error>;
}

/// VolatileStorage keeps the whole log in memory. The interesting machinery
/// in this crate is the consensus and session layering above, so durability
/// is modeled rather than implemented; an on-disk implementation would live
/// under the replica's construction path.
pub(crate) struct VolatileStorage {
    promised: Ballot,
    beginning: u64,
    highest_learned: Option<u64>,
    actions: BTreeMap<u64, Action>,
}

impl VolatileStorage {
    pub(crate) fn create() -> Result<Self, io::Error> {
        Ok(VolatileStorage {
            promised: Ballot::zero(),
            beginning: 0,
            highest_learned: None,
            actions: BTreeMap::new(),
        })
    }
}

impl LogStorage for VolatileStorage {
    fn promised(&self) -> Ballot {
        self.promised
    }

    fn store_promised(&mut self, ballot: Ballot) -> Result<(), io::Error> {
        self.promised = ballot;
        Ok(())
    }

    fn beginning(&self) -> u64 {
        self.beginning
    }

    fn store_beginning(&mut self, position: u64) -> Result<(), io::Error> {
        self.beginning = position;
        self.actions = self.actions.split_off(&position);
        Ok(())
    }

    fn ending(&self) -> u64 {
        match self.highest_learned {
            Some(position) => position + 1,
            None => 0,
        }
    }

    fn action(&self, position: u64) -> Result<Option<Action>, io::Error> {
        Ok(self.actions.get(&position).cloned())
    }

    fn store_action(&mut self, action: Action) -> Result<(), io::Error> {
        if action.learned {
            self.highest_learned = Some(match self.highest_learned {
                Some(highest) => highest.max(action.position),
                None => action.position,
            });
            if let ActionKind::Truncate(to) = action.kind {
                let position = action.position;
                self.actions.insert(position, action);
                // The beginning only ever moves forward.
                let target = to.min(position).max(self.beginning);
                return self.store_beginning(target);
            }
        }
        self.actions.insert(action.position, action);
        Ok(())
    }

    fn actions(&self, from: u64, to: u64) -> Result<Vec<Action>, io::Error> {
        Ok(self.actions.range(from..=to).map(|(_, a)| a.clone()).collect())
    }
}
