use crate::network::Endpoint;
use crate::replica;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;

// The fabric is the process-wide routing table from an endpoint to the
// mailbox of the replica listening there. It plays the role a message-passing
// runtime would: senders look up a destination at dispatch time, and a
// replica that has gone away simply stops being routable.
struct Fabric {
    routes: Mutex<HashMap<Endpoint, mpsc::Sender<replica::Event>>>,
    changed: Notify,
}

lazy_static! {
    static ref FABRIC: Fabric = Fabric {
        routes: Mutex::new(HashMap::new()),
        changed: Notify::new(),
    };
}

/// Claims `endpoint` for the given mailbox. Fails if another replica already
/// listens there. The returned guard releases the route on drop.
pub(crate) fn register(
    endpoint: Endpoint,
    sender: mpsc::Sender<replica::Event>,
) -> Result<Registration, io::Error> {
    let mut routes = FABRIC.routes.lock().expect("fabric routes mutex poison");
    if routes.contains_key(&endpoint) {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("endpoint '{}' already has a registered replica", endpoint),
        ));
    }
    routes.insert(endpoint.clone(), sender);
    drop(routes);

    FABRIC.changed.notify_waiters();
    Ok(Registration { endpoint })
}

/// Route to the replica at `endpoint`, if one is currently registered.
pub(crate) fn route(endpoint: &Endpoint) -> Option<replica::ReplicaClient> {
    let routes = FABRIC.routes.lock().expect("fabric routes mutex poison");
    routes
        .get(endpoint)
        .map(|sender| replica::ReplicaClient::new(endpoint.clone(), sender.clone()))
}

/// Like `route`, but waits for the replica to appear. Recovery uses this so
/// that probing a peer that has not started yet pends instead of failing;
/// a peer set is allowed to come up in any order.
pub(crate) async fn route_when_registered(endpoint: &Endpoint) -> replica::ReplicaClient {
    loop {
        let changed = FABRIC.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        if let Some(client) = route(endpoint) {
            return client;
        }

        changed.await;
    }
}

/// Registration keeps an endpoint claimed; dropping it removes the route.
#[derive(Debug)]
pub(crate) struct Registration {
    endpoint: Endpoint,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut routes = FABRIC.routes.lock().expect("fabric routes mutex poison");
        routes.remove(&self.endpoint);
        drop(routes);
        FABRIC.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_route_deregister() {
        let endpoint = Endpoint::new("/fabric-test/a");
        let (tx, _rx) = mpsc::channel(4);

        let registration = register(endpoint.clone(), tx).unwrap();
        assert!(route(&endpoint).is_some());

        drop(registration);
        assert!(route(&endpoint).is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let endpoint = Endpoint::new("/fabric-test/b");
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        let _registration = register(endpoint.clone(), tx1).unwrap();
        let err = register(endpoint, tx2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn route_when_registered_waits_for_late_peer() {
        let endpoint = Endpoint::new("/fabric-test/c");
        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { route_when_registered(&endpoint).await })
        };

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let (tx, _rx) = mpsc::channel(4);
        let _registration = register(endpoint, tx).unwrap();

        waiter.await.unwrap();
    }
}
