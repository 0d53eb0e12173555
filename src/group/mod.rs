use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Duration;

/// Credentials for the coordination service.
#[derive(Clone, Debug)]
pub struct GroupAuth {
    pub scheme: String,
    pub credentials: String,
}

/// Membership is this replica's ephemeral member id in the group. It stays
/// valid until the service expires it (or the owning session ends), at which
/// point the holder must re-join.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Membership(u64);

struct MemberRecord {
    payload: String,
    session: u64,
}

struct GroupState {
    members: HashMap<u64, MemberRecord>,
    next_member: u64,
    next_session: u64,
}

/// GroupService is the in-process stand-in for the coordination service: a
/// named set of ephemeral members with blocking watches. Services are
/// addressed by `(servers, znode)` through a process-wide registry, so every
/// client connecting with the same coordinates observes the same group.
struct GroupService {
    state: Mutex<GroupState>,
    changed: Notify,
}

impl GroupService {
    fn new() -> Self {
        GroupService {
            state: Mutex::new(GroupState {
                members: HashMap::new(),
                next_member: 0,
                next_session: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn memberships(&self) -> HashSet<Membership> {
        let state = self.state.lock().expect("group state mutex poison");
        state.members.keys().copied().map(Membership).collect()
    }

    fn end_session(&self, session: u64) {
        let mut state = self.state.lock().expect("group state mutex poison");
        state.members.retain(|_, record| record.session != session);
        drop(state);
        self.changed.notify_waiters();
    }
}

lazy_static! {
    static ref SERVICES: Mutex<HashMap<(String, String), Arc<GroupService>>> =
        Mutex::new(HashMap::new());
}

fn service(servers: &str, znode: &str) -> Arc<GroupService> {
    let mut services = SERVICES.lock().expect("group services mutex poison");
    Arc::clone(
        services
            .entry((servers.to_string(), znode.to_string()))
            .or_insert_with(|| Arc::new(GroupService::new())),
    )
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum GroupError {
    #[error("failed to authenticate with the coordination service")]
    AuthenticationFailed,
}

/// Group is one client session against a coordination-service group.
/// Ephemeral members joined through this session disappear when the session
/// is dropped, the way an expiring coordination-service session takes its
/// ephemeral nodes with it.
pub(crate) struct Group {
    service: Arc<GroupService>,
    session: u64,
    session_timeout: Duration,
    auth: Option<GroupAuth>,
}

impl Group {
    pub(crate) fn connect(
        servers: &str,
        session_timeout: Duration,
        znode: &str,
        auth: Option<GroupAuth>,
    ) -> Group {
        let service = service(servers, znode);
        let session = {
            let mut state = service.state.lock().expect("group state mutex poison");
            state.next_session += 1;
            state.next_session
        };

        Group {
            service,
            session,
            session_timeout,
            auth,
        }
    }

    pub(crate) fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub(crate) fn authenticated(&self) -> bool {
        self.auth.is_some()
    }

    fn check_auth(&self) -> Result<(), GroupError> {
        match &self.auth {
            Some(auth) if auth.scheme.is_empty() || auth.credentials.is_empty() => {
                Err(GroupError::AuthenticationFailed)
            }
            _ => Ok(()),
        }
    }

    /// Adds an ephemeral member carrying `payload` (the replica's endpoint).
    pub(crate) async fn join(&self, payload: impl Into<String>) -> Result<Membership, GroupError> {
        self.check_auth()?;
        let payload = payload.into();
        let mut state = self.service.state.lock().expect("group state mutex poison");
        let id = state.next_member;
        state.next_member += 1;
        state.members.insert(
            id,
            MemberRecord {
                payload,
                session: self.session,
            },
        );
        drop(state);

        self.service.changed.notify_waiters();
        Ok(Membership(id))
    }

    /// Resolves with the current membership set once it differs from
    /// `last_seen`. Pass the previously observed set to wait for the next
    /// change; pass an empty set to learn the current one (which resolves
    /// immediately if anyone has joined).
    pub(crate) async fn watch(
        &self,
        last_seen: &HashSet<Membership>,
    ) -> Result<HashSet<Membership>, GroupError> {
        self.check_auth()?;
        loop {
            let changed = self.service.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let current = self.service.memberships();
            if current != *last_seen {
                return Ok(current);
            }

            changed.await;
        }
    }

    /// Payloads (endpoints) of the given members. Members that expired since
    /// the watch fired are silently skipped.
    pub(crate) fn endpoints(&self, memberships: &HashSet<Membership>) -> Vec<String> {
        let state = self.service.state.lock().expect("group state mutex poison");
        memberships
            .iter()
            .filter_map(|m| state.members.get(&m.0).map(|record| record.payload.clone()))
            .collect()
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.service.end_session(self.session);
    }
}

/// Expires every member whose payload equals `payload`, waking watchers.
/// This is how tests model a coordination-service session blip.
#[cfg(test)]
pub(crate) fn expire_member(servers: &str, znode: &str, payload: &str) -> bool {
    let service = service(servers, znode);
    let mut state = service.state.lock().expect("group state mutex poison");
    let before = state.members.len();
    state.members.retain(|_, record| record.payload != payload);
    let expired = state.members.len() < before;
    drop(state);

    if expired {
        service.changed.notify_waiters();
    }
    expired
}

#[cfg(test)]
pub(crate) fn member_payloads(servers: &str, znode: &str) -> Vec<String> {
    let service = service(servers, znode);
    let state = service.state.lock().expect("group state mutex poison");
    state.members.values().map(|record| record.payload.clone()).collect()
}
