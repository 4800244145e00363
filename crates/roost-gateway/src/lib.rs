//! In-process chat server for roost sessions: storage, membership and push
//! fan-out behind the session's backend traits.

pub mod dispatcher;
pub mod memory;

pub use dispatcher::Dispatcher;
pub use memory::{MemoryBackend, MemoryClient, Operation};
