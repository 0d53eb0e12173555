mod actor;
mod coordinator;
mod group;
mod log;
mod network;
mod recovery;
mod replica;
mod shared;

#[cfg(test)]
mod testing;

pub use group::GroupAuth;
pub use log::Entry;
pub use log::Log;
pub use log::LogError;
pub use log::LogReader;
pub use log::LogWriter;
pub use log::Position;
pub use network::Endpoint;
