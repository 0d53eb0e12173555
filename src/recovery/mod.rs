use crate::network;
use crate::network::Network;
use crate::replica::{Replica, ReplicaClient, ReplicaError, StatusReply};
use crate::shared::Shared;
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub(crate) enum RecoverError {
    #[error("the quorum ({quorum}) exceeds the network size ({peers})")]
    QuorumExceedsNetwork { quorum: usize, peers: usize },
    #[error("failed to reach a quorum of replicas while recovering ({responded} of {quorum} responded)")]
    QuorumUnreachable { responded: usize, quorum: usize },
    #[error("replica failure while recovering: {0}")]
    Replica(#[from] ReplicaError),
}

/// Catches the local replica up to a quorum of its peers and hands it back,
/// still exclusively owned. This must finish before the replica is shared
/// with any reader or writer; the manager runs it once, gates every session
/// on the outcome, and cancels it only at teardown (the caller races this
/// future against its stop signal, so cancellation is simply this future
/// being dropped between whole installed actions).
pub(crate) async fn recover(
    quorum: usize,
    replica: Replica,
    network: Shared<Network>,
    logger: slog::Logger,
) -> Result<Replica, RecoverError> {
    // A coordinated network fills in as members join the group; wait for
    // enough of them. A static network either has enough peers or never will.
    if network.is_dynamic() {
        network.watch_size(quorum).await;
    }

    let peers = network.peers();
    if !network.is_dynamic() && peers.len() < quorum {
        return Err(RecoverError::QuorumExceedsNetwork {
            quorum,
            peers: peers.len(),
        });
    }

    slog::info!(
        logger,
        "Recovering the log with quorum {} across {} replicas",
        quorum,
        peers.len()
    );

    let mut probes = JoinSet::new();
    for endpoint in &peers {
        let endpoint = endpoint.clone();
        probes.spawn(async move {
            // Peers are allowed to start in any order; pend until this one
            // is routable rather than failing the probe.
            let client = network::route_when_registered(&endpoint).await;
            let status = client.status().await.ok()?;
            Some((client, status))
        });
    }

    let total = probes.len();
    let mut responses: Vec<(ReplicaClient, StatusReply)> = Vec::with_capacity(quorum);
    let mut failed = 0;

    while let Some(joined) = probes.join_next().await {
        match joined.ok().flatten() {
            Some((client, status)) => {
                slog::debug!(
                    logger,
                    "Replica {} reports positions [{}, {})",
                    client.endpoint(),
                    status.beginning,
                    status.ending
                );
                responses.push((client, status));
                if responses.len() >= quorum {
                    break;
                }
            }
            None => {
                failed += 1;
                if total - failed < quorum {
                    return Err(RecoverError::QuorumUnreachable {
                        responded: responses.len(),
                        quorum,
                    });
                }
            }
        }
    }
    drop(probes);

    if responses.len() < quorum {
        return Err(RecoverError::QuorumUnreachable {
            responded: responses.len(),
            quorum,
        });
    }

    let local_ending = replica.client().ending().await?;
    let target = responses
        .iter()
        .map(|(_, status)| status.ending)
        .max()
        .unwrap_or(0);

    if local_ending >= target {
        slog::info!(logger, "Recovered the log; local replica already consistent");
        return Ok(replica);
    }

    let (source, _) = responses
        .iter()
        .find(|(_, status)| status.ending == target)
        .expect("a response carries the maximum ending");

    let missing = source.fetch(local_ending, target - 1).await?;
    let caught_up = missing.len();
    for action in missing {
        replica.client().install(action).await?;
    }

    slog::info!(
        logger,
        "Recovered the log; caught up {} positions from {}",
        caught_up,
        source.endpoint()
    );
    Ok(replica)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Endpoint;
    use crate::replica::{Action, ActionKind, Ballot};
    use bytes::Bytes;
    use std::collections::HashSet;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn learned(position: u64, kind: ActionKind) -> Action {
        Action {
            position,
            ballot: Ballot { round: 1, salt: 1 },
            performed: true,
            learned: true,
            kind,
        }
    }

    #[tokio::test]
    async fn single_replica_recovers_immediately() {
        let replica = Replica::new("/recovery-test/single", &test_logger()).unwrap();
        let mut peers = HashSet::new();
        peers.insert(replica.endpoint().clone());
        let network = Shared::new(Network::new_static(peers));

        let replica = recover(1, replica, network, test_logger()).await.unwrap();
        assert_eq!(replica.client().ending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lagging_replica_catches_up_to_the_quorum() {
        // -- setup: a peer that already learned three actions --
        let peer = Replica::new("/recovery-test/peer", &test_logger()).unwrap();
        peer.client().install(learned(0, ActionKind::Nop)).await.unwrap();
        peer.client()
            .install(learned(1, ActionKind::Append(Bytes::from_static(b"a"))))
            .await
            .unwrap();
        peer.client()
            .install(learned(2, ActionKind::Append(Bytes::from_static(b"b"))))
            .await
            .unwrap();

        let local = Replica::new("/recovery-test/lagging", &test_logger()).unwrap();
        let mut peers = HashSet::new();
        peers.insert(peer.endpoint().clone());
        peers.insert(local.endpoint().clone());
        let network = Shared::new(Network::new_static(peers));

        // -- execute --
        let local = recover(2, local, network, test_logger()).await.unwrap();

        // -- verify --
        assert_eq!(local.client().ending().await.unwrap(), 3);
        let actions = local.client().read(0, 2).await.unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|action| action.learned));
    }

    #[tokio::test]
    async fn static_network_smaller_than_quorum_fails() {
        let replica = Replica::new("/recovery-test/undersized", &test_logger()).unwrap();
        let mut peers = HashSet::new();
        peers.insert(replica.endpoint().clone());
        peers.insert(Endpoint::new("/recovery-test/absent"));
        let network = Shared::new(Network::new_static(peers));

        match recover(3, replica, network, test_logger()).await {
            Err(RecoverError::QuorumExceedsNetwork { quorum: 3, peers: 2 }) => {}
            other => panic!("expected quorum/network mismatch, got {:?}", other.map(|_| ())),
        }
    }
}
