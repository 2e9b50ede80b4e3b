//! `netsync_server`
//!
//! Server-side replication:
//! - `session`: the authoritative state machine (clients, objects, events)
//! - `server`: the tokio shell that feeds it frames and runs the tick loop
//!
//! Networking model: one TCP stream per client carrying framed messages.

pub mod server;
pub mod session;

pub use server::GameServer;
pub use session::{ClientPhase, DropMode, ServerSession};
