//! Connection bookkeeping shared by every transport.
//!
//! Sessions arrive over the `/ws` WebSocket route or in process through
//! [`SyncServer::connect_local`](crate::SyncServer::connect_local); either way
//! they are registered here and receive broadcasts for the stores they pull.

mod manager;

pub use manager::{Connection, ConnectionManager, MessageSender};
