//! `netsync_client`
//!
//! Client-side replication:
//! - `replica`: mirrors the server's objects from spawn, update and event frames
//! - `client`: the tokio shell owning the connection

pub mod client;
pub mod replica;

pub use client::GameClient;
pub use replica::ClientReplica;
