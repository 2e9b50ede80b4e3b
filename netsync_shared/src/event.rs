//! Event and messaging system.
//!
//! This is a small typed event bus.
//! - Client: connection state changes, object lifecycle and received
//!   updates for the scene.
//! - Server: client lifecycle notifications for game logic.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::object::{ClientId, ComponentId, ObjectId};

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send + Sync>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        if let Some(q) = q.downcast_mut::<Vec<E>>() {
            q.push(e);
        }
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send + Sync>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }
}

/// Published by the server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ClientConnected(ClientId),
    /// Replay finished; the client now replicates every live object.
    ClientJoinedGame(ClientId),
    ClientDisconnected { client: ClientId, reason: String },
}

/// Client connection state, as shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Socket open, handshake sent.
    Connecting,
    JoinedLobby,
    /// Game started; receiving the replay.
    LoadingGame,
    JoinedGame,
    Disconnected,
    /// The connection never got past the handshake.
    ConnectionFailed,
}

/// Published by the client replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    ObjectSpawned { object: ObjectId, template: String },
    /// An `UpdateObject` wrote the slots set in `mask` of one component.
    ObjectUpdated { component: ComponentId, mask: u64 },
    ObjectDestroyed(ObjectId),
}
