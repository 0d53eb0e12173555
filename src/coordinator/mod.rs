use crate::network;
use crate::network::{Endpoint, Network};
use crate::replica::{ActionKind, Ballot, PromiseReply, Replica, ReplicaError, WriteReply};
use crate::shared::Shared;
use bytes::Bytes;
use std::collections::HashSet;
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub(crate) enum CoordinatorError {
    #[error("the coordinator has not been elected")]
    NotElected,
    #[error("lost leadership to ballot {0}")]
    Demoted(Ballot),
    #[error("failed to reach a quorum of replicas ({responded} of {quorum} responded)")]
    QuorumUnreachable { responded: usize, quorum: usize },
    #[error("replica failure: {0}")]
    Replica(#[from] ReplicaError),
}

#[derive(Copy, Clone, Debug)]
enum State {
    Unelected,
    Elected { next: u64 },
}

enum Phase1 {
    Granted { ending: u64 },
    Preempted(Ballot),
}

enum Phase2 {
    Accepted,
    Preempted(Ballot),
}

/// Coordinator drives consensus for one writer: a phase-1 election over the
/// peer set followed by phase-2 writes while its ballot stays the highest
/// one promised. A writer owns at most one and replaces it on every
/// election attempt.
pub(crate) struct Coordinator {
    quorum: usize,
    replica: Shared<Replica>,
    network: Shared<Network>,
    salt: u64,
    ballot: Ballot,
    state: State,
    logger: slog::Logger,
}

impl Coordinator {
    pub(crate) fn new(
        quorum: usize,
        replica: Shared<Replica>,
        network: Shared<Network>,
        logger: slog::Logger,
    ) -> Self {
        Coordinator {
            quorum,
            replica,
            network,
            salt: rand::random(),
            ballot: Ballot::zero(),
            state: State::Unelected,
            logger,
        }
    }

    /// Attempts to become the single writer. `Ok(Some(position))` means
    /// elected, with `position` holding this election's barrier record;
    /// `Ok(None)` means another coordinator got there first and the caller
    /// may retry.
    pub(crate) async fn elect(&mut self) -> Result<Option<u64>, CoordinatorError> {
        self.state = State::Unelected;

        // Propose just past whatever the local replica has promised; a
        // preemption below teaches the local replica a higher round for the
        // next attempt.
        let status = self.replica.client().status().await?;
        let ballot = Ballot {
            round: status.promised.round + 1,
            salt: self.salt,
        };
        let peers = self.network.peers();

        let ending = match self.promise_quorum(ballot, &peers).await? {
            Phase1::Granted { ending } => ending,
            Phase1::Preempted(promised) => {
                slog::debug!(self.logger, "Election preempted by ballot {}", promised);
                return Ok(None);
            }
        };

        // Claim the next position with a barrier record. Until it is decided
        // we are not allowed to serve anything.
        let position = ending;
        match self.write_quorum(ballot, position, ActionKind::Nop, &peers).await? {
            Phase2::Accepted => {}
            Phase2::Preempted(promised) => {
                slog::debug!(self.logger, "Election preempted by ballot {}", promised);
                return Ok(None);
            }
        }
        self.learn(position, &peers).await?;

        slog::debug!(
            self.logger,
            "Elected with ballot {} at position {}",
            ballot,
            position
        );
        self.ballot = ballot;
        self.state = State::Elected { next: position + 1 };
        Ok(Some(position))
    }

    pub(crate) async fn append(&mut self, bytes: Bytes) -> Result<u64, CoordinatorError> {
        self.propose(ActionKind::Append(bytes)).await
    }

    pub(crate) async fn truncate(&mut self, to: u64) -> Result<u64, CoordinatorError> {
        self.propose(ActionKind::Truncate(to)).await
    }

    async fn propose(&mut self, kind: ActionKind) -> Result<u64, CoordinatorError> {
        let position = match self.state {
            State::Elected { next } => next,
            State::Unelected => return Err(CoordinatorError::NotElected),
        };
        let peers = self.network.peers();

        match self.write_quorum(self.ballot, position, kind, &peers).await? {
            Phase2::Accepted => {}
            Phase2::Preempted(promised) => {
                self.state = State::Unelected;
                return Err(CoordinatorError::Demoted(promised));
            }
        }
        self.learn(position, &peers).await?;

        self.state = State::Elected { next: position + 1 };
        Ok(position)
    }

    async fn promise_quorum(
        &self,
        ballot: Ballot,
        peers: &HashSet<Endpoint>,
    ) -> Result<Phase1, CoordinatorError> {
        let mut requests = JoinSet::new();
        for endpoint in peers {
            let endpoint = endpoint.clone();
            requests.spawn(async move {
                match network::route(&endpoint) {
                    Some(client) => client.promise(ballot).await.ok(),
                    None => None,
                }
            });
        }

        let total = requests.len();
        let mut granted = 0;
        let mut failed = 0;
        let mut max_ending = 0;

        while let Some(joined) = requests.join_next().await {
            match joined.ok().flatten() {
                Some(PromiseReply::Granted { ending }) => {
                    granted += 1;
                    max_ending = max_ending.max(ending);
                    if granted >= self.quorum {
                        return Ok(Phase1::Granted { ending: max_ending });
                    }
                }
                Some(PromiseReply::Rejected { promised }) => {
                    return Ok(Phase1::Preempted(promised));
                }
                None => {
                    failed += 1;
                    if total - failed < self.quorum {
                        break;
                    }
                }
            }
        }

        Err(CoordinatorError::QuorumUnreachable {
            responded: granted,
            quorum: self.quorum,
        })
    }

    async fn write_quorum(
        &self,
        ballot: Ballot,
        position: u64,
        kind: ActionKind,
        peers: &HashSet<Endpoint>,
    ) -> Result<Phase2, CoordinatorError> {
        let mut requests = JoinSet::new();
        for endpoint in peers {
            let endpoint = endpoint.clone();
            let kind = kind.clone();
            requests.spawn(async move {
                match network::route(&endpoint) {
                    Some(client) => client.write(ballot, position, kind).await.ok(),
                    None => None,
                }
            });
        }

        let total = requests.len();
        let mut accepted = 0;
        let mut failed = 0;

        while let Some(joined) = requests.join_next().await {
            match joined.ok().flatten() {
                Some(WriteReply::Accepted) => {
                    accepted += 1;
                    if accepted >= self.quorum {
                        return Ok(Phase2::Accepted);
                    }
                }
                Some(WriteReply::Rejected { promised }) => {
                    return Ok(Phase2::Preempted(promised));
                }
                None => {
                    failed += 1;
                    if total - failed < self.quorum {
                        break;
                    }
                }
            }
        }

        Err(CoordinatorError::QuorumUnreachable {
            responded: accepted,
            quorum: self.quorum,
        })
    }

    /// Decides `position` everywhere: synchronously on the local replica so
    /// the caller reads its own write, best-effort on the peers.
    async fn learn(&self, position: u64, peers: &HashSet<Endpoint>) -> Result<(), CoordinatorError> {
        self.replica.client().learn(position).await?;

        for endpoint in peers {
            if endpoint == self.replica.endpoint() {
                continue;
            }
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                if let Some(client) = network::route(&endpoint) {
                    let _ = client.learn(position).await;
                }
            });
        }
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

    fn single_node(path: &str) -> (Shared<Replica>, Shared<Network>) {
        let replica = Replica::new(path, &test_logger()).unwrap();
        let mut peers = HashSet::new();
        peers.insert(replica.endpoint().clone());
        (
            Shared::new(replica),
            Shared::new(Network::new_static(peers)),
        )
    }

    #[tokio::test]
    async fn single_node_elect_append_truncate() {
        let (replica, network) = single_node("/coordinator-test/single");
        let mut coordinator = Coordinator::new(1, replica.clone(), network.clone(), test_logger());

        assert_eq!(coordinator.elect().await.unwrap(), Some(0));
        assert_eq!(coordinator.append(Bytes::from_static(b"a")).await.unwrap(), 1);
        assert_eq!(coordinator.append(Bytes::from_static(b"bb")).await.unwrap(), 2);
        assert_eq!(coordinator.truncate(2).await.unwrap(), 3);

        assert_eq!(replica.client().beginning().await.unwrap(), 2);
        assert_eq!(replica.client().ending().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn append_before_election_fails() {
        let (replica, network) = single_node("/coordinator-test/unelected");
        let mut coordinator = Coordinator::new(1, replica, network, test_logger());

        match coordinator.append(Bytes::from_static(b"a")).await {
            Err(CoordinatorError::NotElected) => {}
            other => panic!("expected NotElected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn later_election_demotes_earlier_coordinator() {
        let (replica, network) = single_node("/coordinator-test/demote");
        let mut first = Coordinator::new(1, replica.clone(), network.clone(), test_logger());
        let mut second = Coordinator::new(1, replica, network, test_logger());

        assert!(first.elect().await.unwrap().is_some());
        assert!(first.append(Bytes::from_static(b"a")).await.is_ok());

        assert!(second.elect().await.unwrap().is_some());

        match first.append(Bytes::from_static(b"b")).await {
            Err(CoordinatorError::Demoted(_)) => {}
            other => panic!("expected demotion, got {:?}", other),
        }
        assert!(second.append(Bytes::from_static(b"c")).await.is_ok());
    }
}
