use crate::actor::Callback;
use crate::group::{Group, GroupError, Membership};
use crate::log::error::LogError;
use crate::network::Network;
use crate::recovery;
use crate::recovery::RecoverError;
use crate::replica::Replica;
use crate::shared::Shared;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub(crate) enum Event {
    AwaitRecovery(Callback<Shared<Replica>, LogError>),
    RecoveryFinished(Result<Replica, RecoverError>),
    GroupJoined(Result<Membership, GroupError>),
    MembershipObserved(Result<HashSet<Membership>, GroupError>),
    Shutdown(Callback<(), LogError>),
}

/// ManagerClient dispatches to the log manager's mailbox. Sessions hold one
/// of these, never the manager itself.
#[derive(Clone)]
pub(crate) struct ManagerClient {
    sender: mpsc::UnboundedSender<Event>,
}

impl ManagerClient {
    /// Resolves once recovery has finished, with the shared replica on
    /// success. Every caller observes the one recovery outcome; callers that
    /// arrive later get it immediately. A manager that went away without
    /// answering means the log was torn down underneath us.
    pub(crate) async fn await_recovery(&self) -> Result<Shared<Replica>, LogError> {
        let (callback, receiver) = Callback::new_pair();
        if self.sender.send(Event::AwaitRecovery(callback)).is_err() {
            return Err(LogError::Deleted);
        }
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(LogError::Deleted),
        }
    }

    pub(crate) fn dispatch_shutdown(&self) -> oneshot::Receiver<Result<(), LogError>> {
        let (callback, receiver) = Callback::new_pair();
        let _ = self.sender.send(Event::Shutdown(callback));
        receiver
    }

    fn downgrade(&self) -> WeakManagerClient {
        WeakManagerClient {
            sender: self.sender.downgrade(),
        }
    }
}

/// WeakManagerClient is what the manager's own background tasks (recovery,
/// group join, group watch) hold: it does not keep the mailbox open, so a
/// log whose handles are all gone can still drain out and tear down.
#[derive(Clone)]
pub(crate) struct WeakManagerClient {
    sender: mpsc::WeakUnboundedSender<Event>,
}

impl WeakManagerClient {
    fn send(&self, event: Event) {
        if let Some(sender) = self.sender.upgrade() {
            let _ = sender.send(event);
        }
    }
}

enum RecoveryState {
    Running { waiters: Vec<Callback<Shared<Replica>, LogError>> },
    Succeeded(Shared<Replica>),
    Failed(LogError),
}

#[derive(Copy, Clone)]
enum MembershipState {
    Absent,
    Joining,
    Joined(Membership),
}

/// ManagerActor owns the log's shared state: it runs recovery exactly once
/// and gates sessions on the outcome, keeps this replica's membership in the
/// coordination group renewed, and at teardown refuses to finish until no
/// session still references the replica or the network.
pub(crate) struct ManagerActor {
    receiver: mpsc::UnboundedReceiver<Event>,
    client: WeakManagerClient,
    network: Shared<Network>,
    recovery: RecoveryState,
    recovery_stop: Option<oneshot::Sender<()>>,
    group: Option<Arc<Group>>,
    membership: MembershipState,
    // The advertised join payload. Kept here because the replica handle
    // itself is away being recovered when a renewal may already be needed.
    endpoint_payload: String,
    join_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    logger: slog::Logger,
}

impl ManagerActor {
    pub(crate) fn spawn(
        quorum: usize,
        replica: Replica,
        network: Shared<Network>,
        group: Option<Group>,
        logger: slog::Logger,
    ) -> (ManagerClient, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = ManagerClient { sender };

        let group = group.map(Arc::new);
        let mut actor = ManagerActor {
            receiver,
            client: client.downgrade(),
            network: network.clone(),
            recovery: RecoveryState::Running { waiters: Vec::new() },
            recovery_stop: None,
            group: group.clone(),
            membership: MembershipState::Absent,
            endpoint_payload: replica.endpoint().as_str().to_string(),
            join_task: None,
            watch_task: None,
            logger: logger.clone(),
        };

        if let Some(group) = group {
            slog::info!(
                logger,
                "Attempting to join the replica to the coordination group \
                 (session timeout {:?}, authenticated {})",
                group.session_timeout(),
                group.authenticated()
            );
            actor.membership = MembershipState::Joining;
            actor.join_task = Some(spawn_join(
                Arc::clone(&group),
                actor.endpoint_payload.clone(),
                client.downgrade(),
            ));
            actor.watch_task = Some(spawn_watch(group, HashSet::new(), client.downgrade()));
        }

        // Start recovery immediately; its completion comes back through the
        // mailbox like any other event, so waiter registration can never
        // race with it.
        let (stop, stopped) = oneshot::channel();
        actor.recovery_stop = Some(stop);
        {
            let weak_client = client.downgrade();
            let recovery_logger = logger.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = recovery::recover(quorum, replica, network, recovery_logger) => {
                        weak_client.send(Event::RecoveryFinished(result));
                    }
                    _ = stopped => {
                        // Teardown cancelled us; the exclusive replica (and
                        // our network reference) just gets dropped.
                    }
                }
            });
        }

        let task = tokio::spawn(actor.run_event_loop());
        (client, task)
    }

    async fn run_event_loop(mut self) {
        loop {
            match self.receiver.recv().await {
                Some(Event::Shutdown(callback)) => {
                    self.finalize().await;
                    callback.send(Ok(()));
                    return;
                }
                Some(event) => self.handle_event(event),
                None => {
                    // Every client handle is gone; tear down in the
                    // background with the same barrier.
                    self.finalize().await;
                    return;
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AwaitRecovery(callback) => match &mut self.recovery {
                RecoveryState::Running { waiters } => waiters.push(callback),
                RecoveryState::Succeeded(replica) => callback.send(Ok(replica.clone())),
                RecoveryState::Failed(failure) => callback.send(Err(failure.clone())),
            },
            Event::RecoveryFinished(result) => self.handle_recovery_finished(result),
            Event::GroupJoined(result) => self.handle_group_joined(result),
            Event::MembershipObserved(result) => self.handle_membership_observed(result),
            Event::Shutdown(_) => unreachable!("shutdown is handled by the event loop"),
        }
    }

    fn handle_recovery_finished(&mut self, result: Result<Replica, RecoverError>) {
        self.recovery_stop = None;

        let next = match result {
            Ok(replica) => {
                slog::info!(self.logger, "Log recovery has finished");
                RecoveryState::Succeeded(Shared::new(replica))
            }
            Err(failure) => {
                slog::error!(self.logger, "Log recovery has failed: {}", failure);
                RecoveryState::Failed(LogError::RecoveryFailed(failure.to_string()))
            }
        };

        let prior = std::mem::replace(&mut self.recovery, next);
        let waiters = match prior {
            RecoveryState::Running { waiters } => waiters,
            _ => unreachable!("recovery finishes exactly once"),
        };

        for callback in waiters {
            match &self.recovery {
                RecoveryState::Succeeded(replica) => callback.send(Ok(replica.clone())),
                RecoveryState::Failed(failure) => callback.send(Err(failure.clone())),
                RecoveryState::Running { .. } => unreachable!(),
            }
        }
    }

    fn handle_group_joined(&mut self, result: Result<Membership, GroupError>) {
        match result {
            Ok(membership) => {
                slog::info!(self.logger, "Joined the coordination group");
                self.membership = MembershipState::Joined(membership);
            }
            Err(failure) => self.fatal(&failure),
        }
    }

    fn handle_membership_observed(&mut self, result: Result<HashSet<Membership>, GroupError>) {
        let memberships = match result {
            Ok(memberships) => memberships,
            Err(failure) => return self.fatal(&failure),
        };

        let group = match &self.group {
            Some(group) => Arc::clone(group),
            None => return,
        };

        // Our membership expired out from under us; join back up. While a
        // join is already in flight there is nothing to renew yet.
        if let MembershipState::Joined(membership) = self.membership {
            if !memberships.contains(&membership) {
                slog::info!(self.logger, "Renewing replica group membership");
                self.membership = MembershipState::Joining;
                self.join_task = Some(spawn_join(
                    Arc::clone(&group),
                    self.endpoint_payload.clone(),
                    self.client.clone(),
                ));
            }
        }

        self.watch_task = Some(spawn_watch(group, memberships, self.client.clone()));
    }

    fn fatal(&self, failure: &GroupError) {
        slog::crit!(
            self.logger,
            "Failed to participate in the coordination group: {}",
            failure
        );
        std::process::exit(1);
    }

    async fn finalize(&mut self) {
        // Stop a recovery that is still in flight.
        if let Some(stop) = self.recovery_stop.take() {
            let _ = stop.send(());
        }

        // Fail everything still gated on recovery.
        if let RecoveryState::Running { waiters } = &mut self.recovery {
            for callback in waiters.drain(..) {
                callback.send(Err(LogError::Deleted));
            }
        }

        // The join/watch tasks hold the group session; wait for them to be
        // gone so dropping it below really retires our membership.
        if let Some(task) = self.join_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.group = None;

        // The teardown barrier: the log is not destroyed while any session
        // still holds the network or the replica.
        self.network.wait_unique().await;
        if let RecoveryState::Succeeded(replica) = &self.recovery {
            replica.wait_unique().await;
        }
        slog::info!(self.logger, "Log teardown complete");
    }
}

fn spawn_join(group: Arc<Group>, payload: String, client: WeakManagerClient) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = group.join(payload).await;
        client.send(Event::GroupJoined(result));
    })
}

fn spawn_watch(
    group: Arc<Group>,
    last_seen: HashSet<Membership>,
    client: WeakManagerClient,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = group.watch(&last_seen).await;
        client.send(Event::MembershipObserved(result));
    })
}
