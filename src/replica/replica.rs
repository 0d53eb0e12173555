use crate::actor::Callback;
use crate::network;
use crate::network::{Endpoint, Registration};
use crate::replica::action::{Action, ActionKind, Ballot};
use crate::replica::storage::{LogStorage, VolatileStorage};
use std::io;
use tokio::sync::mpsc;

const MAILBOX_DEPTH: usize = 64;

/// Mailbox events for the replica actor. `Beginning`/`Ending`/`Read` serve
/// the reading façade; `Status`/`Promise`/`Write`/`Learn` are the consensus
/// protocol driven by coordinators; `Fetch`/`Install` are the catch-up path
/// used while recovering a lagging replica.
#[derive(Debug)]
pub(crate) enum Event {
    Beginning(Callback<u64, ReplicaError>),
    Ending(Callback<u64, ReplicaError>),
    Read {
        from: u64,
        to: u64,
        callback: Callback<Vec<Action>, ReplicaError>,
    },
    Status(Callback<StatusReply, ReplicaError>),
    Promise {
        ballot: Ballot,
        callback: Callback<PromiseReply, ReplicaError>,
    },
    Write {
        ballot: Ballot,
        position: u64,
        kind: ActionKind,
        callback: Callback<WriteReply, ReplicaError>,
    },
    Learn {
        position: u64,
        callback: Callback<(), ReplicaError>,
    },
    Fetch {
        from: u64,
        to: u64,
        callback: Callback<Vec<Action>, ReplicaError>,
    },
    Install {
        action: Action,
        callback: Callback<(), ReplicaError>,
    },
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct StatusReply {
    pub(crate) beginning: u64,
    pub(crate) ending: u64,
    pub(crate) promised: Ballot,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum PromiseReply {
    Granted { ending: u64 },
    Rejected { promised: Ballot },
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum WriteReply {
    Accepted,
    Rejected { promised: Ballot },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReplicaError {
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),
    #[error("bad read range ({0})")]
    BadRange(&'static str),
    #[error("the replica task has exited")]
    Exited,
    #[error("unexpectedly discarded")]
    Discarded,
}

/// ReplicaClient dispatches to a replica's mailbox and awaits the reply.
#[derive(Clone)]
pub(crate) struct ReplicaClient {
    endpoint: Endpoint,
    sender: mpsc::Sender<Event>,
}

impl ReplicaClient {
    pub(crate) fn new(endpoint: Endpoint, sender: mpsc::Sender<Event>) -> Self {
        ReplicaClient { endpoint, sender }
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) async fn beginning(&self) -> Result<u64, ReplicaError> {
        self.call(Event::Beginning).await
    }

    pub(crate) async fn ending(&self) -> Result<u64, ReplicaError> {
        self.call(Event::Ending).await
    }

    pub(crate) async fn read(&self, from: u64, to: u64) -> Result<Vec<Action>, ReplicaError> {
        self.call(|callback| Event::Read { from, to, callback }).await
    }

    pub(crate) async fn status(&self) -> Result<StatusReply, ReplicaError> {
        self.call(Event::Status).await
    }

    pub(crate) async fn promise(&self, ballot: Ballot) -> Result<PromiseReply, ReplicaError> {
        self.call(|callback| Event::Promise { ballot, callback }).await
    }

    pub(crate) async fn write(
        &self,
        ballot: Ballot,
        position: u64,
        kind: ActionKind,
    ) -> Result<WriteReply, ReplicaError> {
        self.call(|callback| Event::Write {
            ballot,
            position,
            kind,
            callback,
        })
        .await
    }

    pub(crate) async fn learn(&self, position: u64) -> Result<(), ReplicaError> {
        self.call(|callback| Event::Learn { position, callback }).await
    }

    pub(crate) async fn fetch(&self, from: u64, to: u64) -> Result<Vec<Action>, ReplicaError> {
        self.call(|callback| Event::Fetch { from, to, callback }).await
    }

    pub(crate) async fn install(&self, action: Action) -> Result<(), ReplicaError> {
        self.call(|callback| Event::Install { action, callback }).await
    }

    async fn call<O>(
        &self,
        build: impl FnOnce(Callback<O, ReplicaError>) -> Event,
    ) -> Result<O, ReplicaError> {
        let (callback, receiver) = Callback::new_pair();
        self.sender
            .send(build(callback))
            .await
            .map_err(|_| ReplicaError::Exited)?;

        // A dropped callback with the mailbox still open means the actor
        // abandoned the event, which is a bug rather than normal teardown.
        receiver.await.map_err(|_| ReplicaError::Discarded)?
    }
}

/// Replica is the owning handle for the local participant: it keeps the
/// endpoint claimed in the fabric and the actor's mailbox open. Dropping the
/// last handle deregisters the endpoint and lets the actor task drain out.
pub(crate) struct Replica {
    endpoint: Endpoint,
    client: ReplicaClient,
    _registration: Registration,
}

impl Replica {
    pub(crate) fn new(path: &str, logger: &slog::Logger) -> Result<Replica, io::Error> {
        let endpoint = Endpoint::new(path);
        let (sender, receiver) = mpsc::channel(MAILBOX_DEPTH);
        let registration = network::register(endpoint.clone(), sender.clone())?;
        let storage = VolatileStorage::create()?;

        let actor_logger = logger.new(slog::o!("replica" => path.to_string()));
        tokio::spawn(ReplicaActor::new(actor_logger, receiver, storage).run_event_loop());

        Ok(Replica {
            client: ReplicaClient::new(endpoint.clone(), sender),
            endpoint,
            _registration: registration,
        })
    }

    /// Takes over an endpoint whose mailbox was registered out-of-band and
    /// starts serving it, backlog included.
    #[cfg(test)]
    pub(crate) fn adopt(
        endpoint: Endpoint,
        sender: mpsc::Sender<Event>,
        receiver: mpsc::Receiver<Event>,
        registration: Registration,
        logger: &slog::Logger,
    ) -> Result<Replica, io::Error> {
        let storage = VolatileStorage::create()?;
        let actor_logger = logger.new(slog::o!("replica" => endpoint.as_str().to_string()));
        tokio::spawn(ReplicaActor::new(actor_logger, receiver, storage).run_event_loop());

        Ok(Replica {
            client: ReplicaClient::new(endpoint.clone(), sender),
            endpoint,
            _registration: registration,
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn client(&self) -> &ReplicaClient {
        &self.client
    }
}

/// ReplicaActor is the single-threaded owner of the replica's storage.
pub(crate) struct ReplicaActor<S: LogStorage> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    storage: S,
}

impl<S: LogStorage> ReplicaActor<S> {
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, storage: S) -> Self {
        ReplicaActor {
            logger,
            receiver,
            storage,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "Received: {:?}", event);
            self.handle_event(event);
        }
    }

    // Handlers are synchronous against storage. Anything slow must live on
    // another actor and come back as an event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Beginning(callback) => {
                callback.send(Ok(self.storage.beginning()));
            }
            Event::Ending(callback) => {
                callback.send(Ok(self.storage.ending()));
            }
            Event::Read { from, to, callback } => {
                callback.send(self.handle_read(from, to));
            }
            Event::Status(callback) => {
                callback.send(Ok(StatusReply {
                    beginning: self.storage.beginning(),
                    ending: self.storage.ending(),
                    promised: self.storage.promised(),
                }));
            }
            Event::Promise { ballot, callback } => {
                callback.send(self.handle_promise(ballot));
            }
            Event::Write {
                ballot,
                position,
                kind,
                callback,
            } => {
                callback.send(self.handle_write(ballot, position, kind));
            }
            Event::Learn { position, callback } => {
                callback.send(self.handle_learn(position));
            }
            Event::Fetch { from, to, callback } => {
                callback.send(self.handle_fetch(from, to));
            }
            Event::Install { action, callback } => {
                callback.send(self.handle_install(action));
            }
        }
    }

    fn handle_read(&mut self, from: u64, to: u64) -> Result<Vec<Action>, ReplicaError> {
        if from < self.storage.beginning() {
            return Err(ReplicaError::BadRange("includes truncated entries"));
        }
        if to >= self.storage.ending() {
            return Err(ReplicaError::BadRange("past end of log"));
        }
        Ok(self.storage.actions(from, to)?)
    }

    fn handle_promise(&mut self, ballot: Ballot) -> Result<PromiseReply, ReplicaError> {
        if ballot > self.storage.promised() {
            self.storage.store_promised(ballot)?;
            Ok(PromiseReply::Granted {
                ending: self.storage.ending(),
            })
        } else {
            Ok(PromiseReply::Rejected {
                promised: self.storage.promised(),
            })
        }
    }

    fn handle_write(
        &mut self,
        ballot: Ballot,
        position: u64,
        kind: ActionKind,
    ) -> Result<WriteReply, ReplicaError> {
        if ballot < self.storage.promised() {
            return Ok(WriteReply::Rejected {
                promised: self.storage.promised(),
            });
        }

        // Accepting implies promising: no older proposer may sneak in below
        // this ballot afterwards.
        if ballot > self.storage.promised() {
            self.storage.store_promised(ballot)?;
        }

        if let Some(existing) = self.storage.action(position)? {
            if existing.learned {
                // The slot is already decided; re-accepting is harmless.
                return Ok(WriteReply::Accepted);
            }
            if existing.ballot > ballot {
                return Ok(WriteReply::Rejected {
                    promised: existing.ballot,
                });
            }
        }

        self.storage.store_action(Action::accepted(position, ballot, kind))?;
        Ok(WriteReply::Accepted)
    }

    fn handle_learn(&mut self, position: u64) -> Result<(), ReplicaError> {
        match self.storage.action(position)? {
            Some(mut action) => {
                if !action.learned {
                    action.learned = true;
                    self.storage.store_action(action)?;
                }
                Ok(())
            }
            None => {
                // A learn can outrun the write it decides when the proposer
                // never reached us; catch-up will fill the hole later.
                slog::debug!(self.logger, "Ignoring learn for unknown position {}", position);
                Ok(())
            }
        }
    }

    fn handle_fetch(&mut self, from: u64, to: u64) -> Result<Vec<Action>, ReplicaError> {
        let actions = self.storage.actions(from, to)?;
        Ok(actions.into_iter().filter(|action| action.learned).collect())
    }

    fn handle_install(&mut self, action: Action) -> Result<(), ReplicaError> {
        self.storage.store_action(action)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn ballot(round: u64) -> Ballot {
        Ballot { round, salt: 7 }
    }

    #[tokio::test]
    async fn promise_grants_only_higher_ballots() {
        let replica = Replica::new("/replica-test/promise", &test_logger()).unwrap();
        let client = replica.client();

        match client.promise(ballot(2)).await.unwrap() {
            PromiseReply::Granted { ending } => assert_eq!(ending, 0),
            other => panic!("expected grant, got {:?}", other),
        }

        // Same ballot again: no longer strictly higher.
        match client.promise(ballot(2)).await.unwrap() {
            PromiseReply::Rejected { promised } => assert_eq!(promised, ballot(2)),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn write_then_learn_moves_the_ending() {
        let replica = Replica::new("/replica-test/learn", &test_logger()).unwrap();
        let client = replica.client();

        client.promise(ballot(1)).await.unwrap();
        let reply = client
            .write(ballot(1), 0, ActionKind::Append(Bytes::from_static(b"a")))
            .await
            .unwrap();
        assert!(matches!(reply, WriteReply::Accepted));

        // Accepted but not learned: still invisible.
        assert_eq!(client.ending().await.unwrap(), 0);

        client.learn(0).await.unwrap();
        assert_eq!(client.ending().await.unwrap(), 1);

        let actions = client.read(0, 0).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].learned);
    }

    #[tokio::test]
    async fn stale_write_is_rejected() {
        let replica = Replica::new("/replica-test/stale", &test_logger()).unwrap();
        let client = replica.client();

        client.promise(ballot(5)).await.unwrap();
        let reply = client
            .write(ballot(3), 0, ActionKind::Nop)
            .await
            .unwrap();
        match reply {
            WriteReply::Rejected { promised } => assert_eq!(promised, ballot(5)),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_outside_the_log_fails() {
        let replica = Replica::new("/replica-test/range", &test_logger()).unwrap();
        let client = replica.client();

        client.promise(ballot(1)).await.unwrap();
        for position in 0..3 {
            client
                .write(ballot(1), position, ActionKind::Append(Bytes::from_static(b"x")))
                .await
                .unwrap();
            client.learn(position).await.unwrap();
        }
        client.write(ballot(1), 3, ActionKind::Truncate(2)).await.unwrap();
        client.learn(3).await.unwrap();

        // Truncated prefix.
        match client.read(1, 1).await {
            Err(ReplicaError::BadRange(reason)) => assert_eq!(reason, "includes truncated entries"),
            other => panic!("expected bad range, got {:?}", other),
        }
        // Beyond the learned suffix.
        match client.read(2, 9).await {
            Err(ReplicaError::BadRange(reason)) => assert_eq!(reason, "past end of log"),
            other => panic!("expected bad range, got {:?}", other),
        }
        // In range still works.
        assert_eq!(client.read(2, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_returns_only_learned_actions() {
        let replica = Replica::new("/replica-test/fetch", &test_logger()).unwrap();
        let client = replica.client();

        client.promise(ballot(1)).await.unwrap();
        client.write(ballot(1), 0, ActionKind::Nop).await.unwrap();
        client.learn(0).await.unwrap();
        client
            .write(ballot(1), 1, ActionKind::Append(Bytes::from_static(b"pending")))
            .await
            .unwrap();

        let learned = client.fetch(0, 10).await.unwrap();
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].position, 0);
    }
}
