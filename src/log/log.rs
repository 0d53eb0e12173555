use crate::group::{Group, GroupAuth};
use crate::log::error::LogError;
use crate::log::manager::{ManagerActor, ManagerClient};
use crate::network::{Endpoint, Network};
use crate::replica::Replica;
use crate::shared::Shared;
use std::collections::HashSet;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Log is a handle on one quorum-replicated log. Constructing it starts the
/// local replica and kicks off recovery; reading and writing happen through
/// `LogReader` and `LogWriter` sessions, which are gated on that recovery
/// finishing. Must be created from within a tokio runtime.
pub struct Log {
    manager: ManagerClient,
    quorum: usize,
    network: Shared<Network>,
    logger: slog::Logger,
    manager_task: ManagerTask,
}

/// Keeps the manager actor from outliving a log that was dropped without
/// `delete()`: plain drop aborts the actor, best effort and without the
/// teardown barrier. `delete()` disarms this and joins the task instead.
struct ManagerTask {
    handle: Option<JoinHandle<()>>,
}

impl ManagerTask {
    fn new(handle: JoinHandle<()>) -> Self {
        ManagerTask {
            handle: Some(handle),
        }
    }

    fn release(mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }
}

impl Drop for ManagerTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl Log {
    /// A log over a fixed set of peer replicas. `path` names the local
    /// replica's storage and doubles as its address; `peers` are the other
    /// replicas' addresses (the local one is implied).
    pub fn new(
        quorum: usize,
        path: &str,
        peers: HashSet<Endpoint>,
        logger: slog::Logger,
    ) -> Result<Log, LogError> {
        let replica = Replica::new(path, &logger)
            .map_err(|failure| LogError::Initialization(failure.to_string()))?;

        // The local replica participates in its own network.
        let network = Network::new_static(peers);
        network.add(replica.endpoint().clone());

        Log::start(quorum, replica, Shared::new(network), None, logger)
    }

    /// A log whose peer set is discovered through the coordination service:
    /// this replica joins the group at `znode` and the network follows the
    /// group's membership. Membership is renewed for as long as the log is
    /// alive; failures to join or watch the group are fatal by design.
    pub fn new_dynamic(
        quorum: usize,
        path: &str,
        servers: &str,
        session_timeout: Duration,
        znode: &str,
        auth: Option<GroupAuth>,
        logger: slog::Logger,
    ) -> Result<Log, LogError> {
        let replica = Replica::new(path, &logger)
            .map_err(|failure| LogError::Initialization(failure.to_string()))?;

        let network = Shared::new(Network::new_dynamic(
            Group::connect(servers, session_timeout, znode, auth.clone()),
            logger.new(slog::o!("component" => "network")),
        ));
        let group = Group::connect(servers, session_timeout, znode, auth);

        Log::start(quorum, replica, network, Some(group), logger)
    }

    fn start(
        quorum: usize,
        replica: Replica,
        network: Shared<Network>,
        group: Option<Group>,
        logger: slog::Logger,
    ) -> Result<Log, LogError> {
        let (manager, manager_task) =
            ManagerActor::spawn(quorum, replica, network.clone(), group, logger.clone());

        Ok(Log {
            manager,
            quorum,
            network,
            logger,
            manager_task: ManagerTask::new(manager_task),
        })
    }

    /// Tears the log down: cancels a pending recovery, fails everything
    /// still gated on it with "the log is being deleted", and returns only
    /// once no session still references the replica or the network. Sessions
    /// must be dropped for that barrier to clear.
    pub async fn delete(self) {
        let Log {
            manager,
            network,
            logger,
            manager_task,
            ..
        } = self;

        // Our own network reference has to go first, or the manager's
        // uniqueness barrier would wait on us.
        drop(network);

        slog::info!(logger, "Deleting the log");
        let acknowledged = manager.dispatch_shutdown();
        let _ = acknowledged.await;

        // The manager acknowledged and is returning on its own; joining it
        // instead of letting the abort guard fire preserves the barrier.
        if let Some(task) = manager_task.release() {
            let _ = task.await;
        }
    }

    pub(crate) fn manager(&self) -> &ManagerClient {
        &self.manager
    }

    pub(crate) fn quorum(&self) -> usize {
        self.quorum
    }

    pub(crate) fn network(&self) -> &Shared<Network> {
        &self.network
    }

    pub(crate) fn logger(&self) -> &slog::Logger {
        &self.logger
    }
}
