//! Test support: fabric occupants that misbehave in controlled ways.

use crate::network;
use crate::network::Endpoint;
use crate::replica;
use crate::replica::Replica;
use std::io;
use tokio::sync::mpsc;

/// StalledReplica claims an endpoint in the fabric but never serves it:
/// messages queue up unanswered, which is how tests model a replica that is
/// reachable but wedged. `revive` turns it into a real replica that drains
/// the backlog.
pub(crate) struct StalledReplica {
    endpoint: Endpoint,
    sender: mpsc::Sender<replica::Event>,
    receiver: mpsc::Receiver<replica::Event>,
    registration: network::Registration,
}

impl StalledReplica {
    pub(crate) fn occupy(path: &str) -> Result<StalledReplica, io::Error> {
        let endpoint = Endpoint::new(path);
        let (sender, receiver) = mpsc::channel(64);
        let registration = network::register(endpoint.clone(), sender.clone())?;

        Ok(StalledReplica {
            endpoint,
            sender,
            receiver,
            registration,
        })
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn revive(self, logger: &slog::Logger) -> Replica {
        Replica::adopt(
            self.endpoint,
            self.sender,
            self.receiver,
            self.registration,
            logger,
        )
        .expect("reviving a stalled replica")
    }
}
