mod fabric;

pub(crate) use fabric::register;
pub(crate) use fabric::route;
pub(crate) use fabric::route_when_registered;
pub(crate) use fabric::Registration;

use crate::group::Group;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Endpoint is the address of one replica in the fabric. The replica's
/// storage path doubles as its endpoint, so a peer set is just the set of
/// paths the other replicas were started with.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Endpoint(endpoint.into())
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PeerSet {
    peers: Mutex<HashSet<Endpoint>>,
    changed: Notify,
}

impl PeerSet {
    fn replace(&self, peers: HashSet<Endpoint>) {
        *self.peers.lock().expect("peer set mutex poison") = peers;
        self.changed.notify_waiters();
    }
}

/// Network is the handle on the set of replicas participating in this log.
/// Static networks are fixed at construction; coordinated networks follow
/// the membership of a coordination-service group. The manager and every
/// live writer's coordinator jointly own one through `Shared<Network>`.
pub(crate) struct Network {
    peers: Arc<PeerSet>,
    dynamic: bool,
    watcher: Option<JoinHandle<()>>,
}

impl Network {
    pub(crate) fn new_static(peers: HashSet<Endpoint>) -> Network {
        Network {
            peers: Arc::new(PeerSet {
                peers: Mutex::new(peers),
                changed: Notify::new(),
            }),
            dynamic: false,
            watcher: None,
        }
    }

    /// A network whose peer set tracks the group's membership. The watcher
    /// task owns its own group session and runs until the network is
    /// dropped; a watch failure is fatal, same as the manager's renewer.
    pub(crate) fn new_dynamic(group: Group, logger: slog::Logger) -> Network {
        let peers = Arc::new(PeerSet {
            peers: Mutex::new(HashSet::new()),
            changed: Notify::new(),
        });

        let watcher = {
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                let mut last_seen = HashSet::new();
                loop {
                    match group.watch(&last_seen).await {
                        Ok(memberships) => {
                            let endpoints = group
                                .endpoints(&memberships)
                                .into_iter()
                                .map(Endpoint::new)
                                .collect();
                            slog::debug!(logger, "Network follows group membership: {:?}", endpoints);
                            peers.replace(endpoints);
                            last_seen = memberships;
                        }
                        Err(failure) => {
                            slog::crit!(
                                logger,
                                "Failed to watch the coordination group: {}",
                                failure
                            );
                            std::process::exit(1);
                        }
                    }
                }
            })
        };

        Network {
            peers,
            dynamic: true,
            watcher: Some(watcher),
        }
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Snapshot of the current peer set (includes the local replica).
    pub(crate) fn peers(&self) -> HashSet<Endpoint> {
        self.peers.peers.lock().expect("peer set mutex poison").clone()
    }

    pub(crate) fn add(&self, endpoint: Endpoint) {
        let mut peers = self.peers.peers.lock().expect("peer set mutex poison");
        if peers.insert(endpoint) {
            drop(peers);
            self.peers.changed.notify_waiters();
        }
    }

    /// Resolves once the peer set holds at least `min` endpoints. Static
    /// networks satisfy this immediately or never; coordinated networks
    /// satisfy it as members join the group.
    pub(crate) async fn watch_size(&self, min: usize) {
        loop {
            let changed = self.peers.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.peers().len() >= min {
                return;
            }

            changed.await;
        }
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_network_snapshot_and_add() {
        let mut peers = HashSet::new();
        peers.insert(Endpoint::new("/a"));

        let network = Network::new_static(peers);
        assert!(!network.is_dynamic());
        assert_eq!(network.peers().len(), 1);

        network.add(Endpoint::new("/b"));
        assert_eq!(network.peers().len(), 2);
    }

    #[tokio::test]
    async fn watch_size_resolves_when_peers_arrive() {
        let network = Arc::new(Network::new_static(HashSet::new()));
        // Size zero is trivially satisfied.
        network.watch_size(0).await;

        let waiter = {
            let network = Arc::clone(&network);
            tokio::spawn(async move { network.watch_size(1).await })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        network.add(Endpoint::new("/late"));
        waiter.await.unwrap();
    }
}
