use crate::actor::Callback;
use crate::log::error::LogError;
use crate::log::gate::RecoveryGate;
use crate::log::log::Log;
use crate::log::position::{Entry, Position};
use crate::replica::{Action, ActionKind};
use tokio::sync::mpsc;
use tokio::time::Duration;

const MAILBOX_DEPTH: usize = 64;

#[derive(Debug)]
pub(crate) enum Event {
    Beginning(Callback<Position, LogError>),
    Ending(Callback<Position, LogError>),
    Read {
        from: Position,
        to: Position,
        callback: Callback<Vec<Entry>, LogError>,
    },
}

/// LogReader is a session for reading one log. Every operation first waits
/// out recovery, then serves from the local replica; reads validate that
/// the range holds only decided entries before surfacing the appends.
pub struct LogReader {
    sender: mpsc::Sender<Event>,
    logger: slog::Logger,
}

impl LogReader {
    pub fn new(log: &Log) -> LogReader {
        let logger = log.logger().new(slog::o!("component" => "log-reader"));
        let (sender, receiver) = mpsc::channel(MAILBOX_DEPTH);

        let actor = ReaderActor {
            gate: RecoveryGate::new(log.manager().clone()),
            receiver,
            logger: logger.clone(),
        };
        tokio::spawn(actor.run_event_loop());

        LogReader { sender, logger }
    }

    /// Earliest readable position.
    pub async fn beginning(&self) -> Result<Position, LogError> {
        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Beginning(callback))
            .await
            .map_err(|_| LogError::ReaderDeleted)?;
        receiver.await.map_err(|_| LogError::ReaderDeleted)?
    }

    /// One past the last learned position.
    pub async fn ending(&self) -> Result<Position, LogError> {
        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Ending(callback))
            .await
            .map_err(|_| LogError::ReaderDeleted)?;
        receiver.await.map_err(|_| LogError::ReaderDeleted)?
    }

    /// All appended entries with positions in `[from, to]`, in ascending
    /// order. `Ok(None)` means the deadline elapsed first; the pending read
    /// is cancelled best-effort and the log is untouched.
    pub async fn read(
        &self,
        from: Position,
        to: Position,
        timeout: Duration,
    ) -> Result<Option<Vec<Entry>>, LogError> {
        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Read { from, to, callback })
            .await
            .map_err(|_| LogError::ReaderDeleted)?;

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => {
                // Dropping the receiver is the cancellation: the session
                // actor sees the abandoned callback and walks away.
                slog::info!(self.logger, "Timed out while trying to read the log");
                Ok(None)
            }
            Ok(Err(_)) => Err(LogError::ReaderDeleted),
            Ok(Ok(result)) => result.map(Some),
        }
    }
}

struct ReaderActor {
    gate: RecoveryGate,
    receiver: mpsc::Receiver<Event>,
    logger: slog::Logger,
}

impl ReaderActor {
    async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Beginning(callback) => {
                let replica = match self.gate.resolve().await {
                    Ok(replica) => replica,
                    Err(failure) => return callback.send(Err(failure)),
                };
                match replica.client().beginning().await {
                    Ok(value) => callback.send(Ok(Position::new(value))),
                    Err(failure) => callback.send(Err(failure.into())),
                }
            }
            Event::Ending(callback) => {
                let replica = match self.gate.resolve().await {
                    Ok(replica) => replica,
                    Err(failure) => return callback.send(Err(failure)),
                };
                match replica.client().ending().await {
                    Ok(value) => callback.send(Ok(Position::new(value))),
                    Err(failure) => callback.send(Err(failure.into())),
                }
            }
            Event::Read { from, to, callback } => self.handle_read(from, to, callback).await,
        }
    }

    async fn handle_read(
        &mut self,
        from: Position,
        to: Position,
        mut callback: Callback<Vec<Entry>, LogError>,
    ) {
        let replica = match self.gate.resolve().await {
            Ok(replica) => replica,
            Err(failure) => return callback.send(Err(failure)),
        };

        if to < from {
            return callback.send(Ok(Vec::new()));
        }

        let result = tokio::select! {
            result = replica.client().read(from.value(), to.value()) => result,
            _ = callback.closed() => {
                slog::debug!(self.logger, "Abandoning a read nobody is waiting for");
                return;
            }
        };

        match result {
            Ok(actions) => callback.send(validate_read(from, actions)),
            Err(failure) => callback.send(Err(failure.into())),
        }
    }
}

/// Walks the actions the replica returned and keeps only the appends,
/// insisting that the whole range is decided and gap-free.
fn validate_read(from: Position, actions: Vec<Action>) -> Result<Vec<Entry>, LogError> {
    let mut entries = Vec::new();
    let mut expected = from.value();

    for action in actions {
        if !action.performed || !action.learned {
            return Err(LogError::PendingEntries);
        }
        if action.position != expected {
            return Err(LogError::MissingEntries);
        }
        expected += 1;

        // Only appends surface; truncates and nops still occupy positions.
        if let ActionKind::Append(data) = action.kind {
            entries.push(Entry {
                position: Position::new(action.position),
                data,
            });
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::Ballot;
    use bytes::Bytes;

    fn action(position: u64, learned: bool, kind: ActionKind) -> Action {
        Action {
            position,
            ballot: Ballot { round: 1, salt: 1 },
            performed: true,
            learned,
            kind,
        }
    }

    #[test]
    fn validate_read_keeps_only_appends() {
        let actions = vec![
            action(3, true, ActionKind::Nop),
            action(4, true, ActionKind::Append(Bytes::from_static(b"a"))),
            action(5, true, ActionKind::Truncate(2)),
            action(6, true, ActionKind::Append(Bytes::from_static(b"b"))),
        ];

        let entries = validate_read(Position::new(3), actions).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].position, Position::new(4));
        assert_eq!(entries[0].data, Bytes::from_static(b"a"));
        assert_eq!(entries[1].position, Position::new(6));
    }

    #[test]
    fn validate_read_rejects_pending_entries() {
        let actions = vec![
            action(0, true, ActionKind::Nop),
            action(1, false, ActionKind::Append(Bytes::from_static(b"a"))),
        ];

        assert_eq!(
            validate_read(Position::new(0), actions),
            Err(LogError::PendingEntries)
        );
    }

    #[test]
    fn validate_read_rejects_gaps() {
        let actions = vec![
            action(0, true, ActionKind::Nop),
            action(2, true, ActionKind::Append(Bytes::from_static(b"a"))),
        ];

        assert_eq!(
            validate_read(Position::new(0), actions),
            Err(LogError::MissingEntries)
        );
    }

    #[test]
    fn validate_read_rejects_offset_start() {
        let actions = vec![action(1, true, ActionKind::Nop)];
        assert_eq!(
            validate_read(Position::new(0), actions),
            Err(LogError::MissingEntries)
        );
    }

    #[test]
    fn validate_read_accepts_empty() {
        assert_eq!(validate_read(Position::new(5), Vec::new()), Ok(Vec::new()));
    }
}
