use crate::actor::Callback;
use crate::coordinator::Coordinator;
use crate::log::error::LogError;
use crate::log::gate::RecoveryGate;
use crate::log::log::Log;
use crate::log::position::Position;
use crate::network::Network;
use crate::shared::Shared;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;

const MAILBOX_DEPTH: usize = 64;

#[derive(Debug)]
pub(crate) enum Event {
    Elect(Callback<Option<Position>, LogError>),
    Append {
        data: Bytes,
        callback: Callback<Position, LogError>,
    },
    Truncate {
        to: Position,
        callback: Callback<Position, LogError>,
    },
}

/// LogWriter is a session for mutating one log. Construction runs a bounded
/// election loop; afterwards `append` and `truncate` go through the session's
/// coordinator for as long as it stays the leader. Once a coordinator call
/// fails the session refuses further writes until a fresh election, so a
/// demoted writer cannot keep quietly issuing requests.
pub struct LogWriter {
    sender: mpsc::Sender<Event>,
    logger: slog::Logger,
}

impl LogWriter {
    /// Spawns the session and tries to get elected, waiting up to `timeout`
    /// per attempt and retrying up to `retries` times after timeouts and
    /// lost elections. Losing is expected when candidates race, so it only
    /// costs a retry. The writer is returned either way; if election never
    /// succeeded, the first write reports why.
    pub async fn new(log: &Log, timeout: Duration, retries: usize) -> LogWriter {
        let logger = log.logger().new(slog::o!("component" => "log-writer"));
        let (sender, receiver) = mpsc::channel(MAILBOX_DEPTH);

        let actor = WriterActor {
            quorum: log.quorum(),
            network: log.network().clone(),
            gate: RecoveryGate::new(log.manager().clone()),
            coordinator: None,
            error: None,
            receiver,
            logger: logger.clone(),
        };
        tokio::spawn(actor.run_event_loop());

        let writer = LogWriter { sender, logger };

        let mut retries_left = retries;
        loop {
            slog::info!(writer.logger, "Attempting to get elected within {:?}", timeout);

            let receiver = match writer.dispatch_elect().await {
                Ok(receiver) => receiver,
                Err(_) => break,
            };

            match tokio::time::timeout(timeout, receiver).await {
                Err(_) => {
                    // The election likely finishes right after the deadline;
                    // rerunning it then is wasteful but safe.
                    slog::info!(writer.logger, "Timed out while trying to get elected");
                }
                Ok(Err(_)) => {
                    slog::error!(writer.logger, "Failed to get elected: {}", LogError::WriterDeleted);
                    break;
                }
                Ok(Ok(Err(failure))) => {
                    slog::error!(writer.logger, "Failed to get elected: {}", failure);
                    break;
                }
                Ok(Ok(Ok(None))) => {
                    slog::info!(writer.logger, "Lost an election, but can be retried");
                }
                Ok(Ok(Ok(Some(position)))) => {
                    slog::info!(writer.logger, "Elected with current position {}", position);
                    break;
                }
            }

            if retries_left == 0 {
                slog::error!(writer.logger, "Retry limit has been reached during election");
                break;
            }
            retries_left -= 1;
        }

        writer
    }

    /// Appends `data` and resolves with the position it was decided at.
    /// `Ok(None)` means the deadline elapsed; the in-flight append is
    /// cancelled best-effort.
    pub async fn append(
        &self,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Option<Position>, LogError> {
        slog::debug!(
            self.logger,
            "Attempting to append {} bytes to the log",
            data.len()
        );

        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Append { data, callback })
            .await
            .map_err(|_| LogError::WriterDeleted)?;

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => {
                slog::info!(self.logger, "Timed out while trying to append the log");
                Ok(None)
            }
            Ok(Err(_)) => Err(LogError::WriterDeleted),
            Ok(Ok(result)) => result.map(Some),
        }
    }

    /// Truncates the log up to (excluding) `to`. Resolves with the position
    /// the truncate itself was decided at.
    pub async fn truncate(
        &self,
        to: Position,
        timeout: Duration,
    ) -> Result<Option<Position>, LogError> {
        slog::debug!(self.logger, "Attempting to truncate the log to {}", to);

        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Truncate { to, callback })
            .await
            .map_err(|_| LogError::WriterDeleted)?;

        match tokio::time::timeout(timeout, receiver).await {
            Err(_) => {
                slog::info!(self.logger, "Timed out while trying to truncate the log");
                Ok(None)
            }
            Ok(Err(_)) => Err(LogError::WriterDeleted),
            Ok(Ok(result)) => result.map(Some),
        }
    }

    async fn dispatch_elect(
        &self,
    ) -> Result<oneshot::Receiver<Result<Option<Position>, LogError>>, LogError> {
        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(Event::Elect(callback))
            .await
            .map_err(|_| LogError::WriterDeleted)?;
        Ok(receiver)
    }
}

struct WriterActor {
    quorum: usize,
    network: Shared<Network>,
    gate: RecoveryGate,
    coordinator: Option<Coordinator>,
    error: Option<LogError>,
    receiver: mpsc::Receiver<Event>,
    logger: slog::Logger,
}

impl WriterActor {
    async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event).await;
        }
        // Dropping the actor drops the coordinator with it.
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Elect(callback) => self.handle_elect(callback).await,
            Event::Append { data, callback } => self.handle_append(data, callback).await,
            Event::Truncate { to, callback } => self.handle_truncate(to, callback).await,
        }
    }

    async fn handle_elect(&mut self, mut callback: Callback<Option<Position>, LogError>) {
        let replica = match self.gate.resolve().await {
            Ok(replica) => replica,
            Err(failure) => return callback.send(Err(failure)),
        };

        // Each election gets a fresh coordinator; the previous one and any
        // sticky failure go away first.
        self.coordinator = None;
        self.error = None;

        let mut coordinator = Coordinator::new(
            self.quorum,
            replica,
            self.network.clone(),
            self.logger.clone(),
        );

        let result = tokio::select! {
            result = coordinator.elect() => result,
            _ = callback.closed() => {
                slog::debug!(self.logger, "Abandoning an election nobody is waiting for");
                return;
            }
        };

        match result {
            Ok(position) => {
                self.coordinator = Some(coordinator);
                callback.send(Ok(position.map(Position::new)));
            }
            Err(failure) => {
                let failure = LogError::Coordinator(failure.to_string());
                self.coordinator = Some(coordinator);
                self.error = Some(failure.clone());
                callback.send(Err(failure));
            }
        }
    }

    async fn handle_append(&mut self, data: Bytes, mut callback: Callback<Position, LogError>) {
        let coordinator = match self.coordinator.as_mut() {
            Some(coordinator) => coordinator,
            None => return callback.send(Err(LogError::NoElection)),
        };
        if let Some(failure) = &self.error {
            return callback.send(Err(failure.clone()));
        }

        let result = tokio::select! {
            result = coordinator.append(data) => result,
            _ = callback.closed() => {
                slog::debug!(self.logger, "Abandoning an append nobody is waiting for");
                return;
            }
        };

        match result {
            Ok(position) => callback.send(Ok(Position::new(position))),
            Err(failure) => {
                let failure = LogError::Coordinator(failure.to_string());
                self.error = Some(failure.clone());
                callback.send(Err(failure));
            }
        }
    }

    async fn handle_truncate(&mut self, to: Position, mut callback: Callback<Position, LogError>) {
        let coordinator = match self.coordinator.as_mut() {
            Some(coordinator) => coordinator,
            None => return callback.send(Err(LogError::NoElection)),
        };
        if let Some(failure) = &self.error {
            return callback.send(Err(failure.clone()));
        }

        let result = tokio::select! {
            result = coordinator.truncate(to.value()) => result,
            _ = callback.closed() => {
                slog::debug!(self.logger, "Abandoning a truncate nobody is waiting for");
                return;
            }
        };

        match result {
            Ok(position) => callback.send(Ok(Position::new(position))),
            Err(failure) => {
                let failure = LogError::Coordinator(failure.to_string());
                self.error = Some(failure.clone());
                callback.send(Err(failure));
            }
        }
    }
}
