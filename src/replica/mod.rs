mod action;
mod replica;
mod storage;

pub(crate) use action::Action;
pub(crate) use action::ActionKind;
pub(crate) use action::Ballot;
pub(crate) use replica::Event;
pub(crate) use replica::PromiseReply;
pub(crate) use replica::Replica;
pub(crate) use replica::ReplicaClient;
pub(crate) use replica::ReplicaError;
pub(crate) use replica::StatusReply;
pub(crate) use replica::WriteReply;
pub(crate) use storage::LogStorage;
pub(crate) use storage::VolatileStorage;
