use crate::log::error::LogError;
use crate::log::manager::ManagerClient;
use crate::replica::Replica;
use crate::shared::Shared;

enum GateState {
    Unresolved,
    Ready(Shared<Replica>),
    Failed(LogError),
}

/// RecoveryGate is a session's deferred reference to the shared replica.
/// The first resolution asks the manager and memoizes the outcome, so a
/// session observes recovery exactly once: a failure is as sticky for the
/// session as success is.
pub(crate) struct RecoveryGate {
    manager: ManagerClient,
    state: GateState,
}

impl RecoveryGate {
    pub(crate) fn new(manager: ManagerClient) -> Self {
        RecoveryGate {
            manager,
            state: GateState::Unresolved,
        }
    }

    pub(crate) async fn resolve(&mut self) -> Result<Shared<Replica>, LogError> {
        match &self.state {
            GateState::Ready(replica) => return Ok(replica.clone()),
            GateState::Failed(failure) => return Err(failure.clone()),
            GateState::Unresolved => {}
        }

        match self.manager.await_recovery().await {
            Ok(replica) => {
                self.state = GateState::Ready(replica.clone());
                Ok(replica)
            }
            Err(failure) => {
                self.state = GateState::Failed(failure.clone());
                Err(failure)
            }
        }
    }
}
