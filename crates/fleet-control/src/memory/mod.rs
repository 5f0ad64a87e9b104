//! In-process implementations of the external collaborators, for tests and
//! single process setups.

mod broker;
mod cache;
mod crawler;
mod repo;

pub use broker::{MemoryBroker, MemoryMessage, Outcome};
pub use cache::MemoryCache;
pub use crawler::{ScriptedClient, ScriptedConnector};
pub use repo::MemoryRepo;
