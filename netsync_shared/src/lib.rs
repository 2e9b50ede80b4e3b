//! `netsync_shared`
//!
//! Replication core used by both client and server.
//!
//! Design goals:
//! - Server authoritative: clients request, the server decides.
//! - Explicit slot lists and a fixed set of wire types, no reflection.
//! - No global state: sessions own their counters, registries and buses.
//! - No `unsafe`.

pub mod channel;
pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod event;
pub mod math;
pub mod message;
pub mod net;
pub mod networkable;
pub mod object;
pub mod registry;
pub mod sync_var;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::channel::{
        Channels, Event, EventContext, EventInvoker, EventRecipients, EventTimeframe, Request,
        RequestContext, RequestInvoker,
    };
    pub use crate::codec::{MessageType, RawFrame, WireValue};
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::networkable::{Networkable, NetworkableType};
    pub use crate::object::{ClientId, ComponentId, NetworkObject, ObjectId, Owner};
    pub use crate::registry::{ComponentTypeId, Registry, TemplateId};
    pub use crate::sync_var::{SyncField, SyncVar};
}
