//! Requests and events.
//!
//! A component type declares its channels once, when it is registered.
//! Objects collect the declarations of their components in component order,
//! so a channel's numeric id is the same on every peer and names never cross
//! the wire.
//!
//! Requests flow client to server and are checked against ownership. Events
//! flow server to clients; long-term events are also retained for replay to
//! clients that start replicating the object later.

use std::{
    any::{Any, TypeId},
    fmt,
    marker::PhantomData,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    codec::WireValue,
    error::{DecodeError, NetError},
    networkable::{Networkable, NetworkableType},
    object::{ObjectId, Owner},
};

pub type RequestHandler<C, P> = fn(&mut C, &P, &RequestContext);
pub type EventHandler<C, P> = fn(&mut C, &P, &EventContext);

/// Passed to request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub object: ObjectId,
    /// `Owner::Server` for server-initiated calls.
    pub sender: Owner,
}

/// Passed to event handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext {
    pub object: ObjectId,
    /// True when the handler runs on the authoritative side.
    pub on_server: bool,
}

/// Which clients receive an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventRecipients {
    /// Clients currently replicating the object.
    #[default]
    ActiveClients,
    /// Only the owning client, if it replicates the object.
    Owner,
    /// Every handshaken client.
    AllClients,
}

/// Whether an event is retained for late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventTimeframe {
    #[default]
    Instant,
    LongTermDelayable,
}

pub(crate) trait ErasedHandler<X>: Send + Sync {
    fn payload_type(&self) -> TypeId;

    /// Decodes the payload and calls the handler.
    fn call_bytes(
        &self,
        target: &mut dyn Networkable,
        payload: &[u8],
        ctx: &X,
    ) -> Result<(), DecodeError>;

    /// Calls the handler with an already typed payload.
    fn call_local(
        &self,
        target: &mut dyn Networkable,
        data: &dyn Any,
        ctx: &X,
    ) -> Result<(), DecodeError>;
}

struct TypedHandler<C, P, X> {
    handler: fn(&mut C, &P, &X),
}

fn downcast<C: NetworkableType>(target: &mut dyn Networkable) -> Result<&mut C, DecodeError> {
    target
        .as_any_mut()
        .downcast_mut::<C>()
        .ok_or(DecodeError::ComponentTypeMismatch)
}

impl<C, P, X> ErasedHandler<X> for TypedHandler<C, P, X>
where
    C: NetworkableType,
    P: WireValue + 'static,
    X: 'static,
{
    fn payload_type(&self) -> TypeId {
        TypeId::of::<P>()
    }

    fn call_bytes(
        &self,
        target: &mut dyn Networkable,
        payload: &[u8],
        ctx: &X,
    ) -> Result<(), DecodeError> {
        let data = P::from_wire(payload)?;
        (self.handler)(downcast::<C>(target)?, &data, ctx);
        Ok(())
    }

    fn call_local(
        &self,
        target: &mut dyn Networkable,
        data: &dyn Any,
        ctx: &X,
    ) -> Result<(), DecodeError> {
        let data = data
            .downcast_ref::<P>()
            .ok_or(DecodeError::PayloadTypeMismatch)?;
        (self.handler)(downcast::<C>(target)?, data, ctx);
        Ok(())
    }
}

/// A request declared by a component type.
#[derive(Clone)]
pub struct RequestDecl {
    name: &'static str,
    handler: Arc<dyn ErasedHandler<RequestContext>>,
}

impl RequestDecl {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn payload_type(&self) -> TypeId {
        self.handler.payload_type()
    }

    pub(crate) fn handler(&self) -> &dyn ErasedHandler<RequestContext> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for RequestDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDecl").field("name", &self.name).finish()
    }
}

/// An event declared by a component type.
#[derive(Clone)]
pub struct EventDecl {
    name: &'static str,
    recipients: EventRecipients,
    timeframe: EventTimeframe,
    handler: Arc<dyn ErasedHandler<EventContext>>,
}

impl EventDecl {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn recipients(&self) -> EventRecipients {
        self.recipients
    }

    pub fn timeframe(&self) -> EventTimeframe {
        self.timeframe
    }

    pub fn payload_type(&self) -> TypeId {
        self.handler.payload_type()
    }

    pub(crate) fn handler(&self) -> &dyn ErasedHandler<EventContext> {
        self.handler.as_ref()
    }
}

impl fmt::Debug for EventDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDecl")
            .field("name", &self.name)
            .field("recipients", &self.recipients)
            .field("timeframe", &self.timeframe)
            .finish()
    }
}

/// Channel declarations of one component type.
pub struct Channels<C> {
    requests: Vec<RequestDecl>,
    events: Vec<EventDecl>,
    _component: PhantomData<fn(&mut C)>,
}

impl<C: NetworkableType> Channels<C> {
    pub(crate) fn new() -> Self {
        Self {
            requests: Vec::new(),
            events: Vec::new(),
            _component: PhantomData,
        }
    }

    /// Declares a client to server request.
    pub fn request<P: WireValue + 'static>(
        &mut self,
        name: &'static str,
        handler: RequestHandler<C, P>,
    ) -> &mut Self {
        self.requests.push(RequestDecl {
            name,
            handler: Arc::new(TypedHandler { handler }),
        });
        self
    }

    /// Declares a server to client event.
    pub fn event<P: WireValue + 'static>(
        &mut self,
        name: &'static str,
        recipients: EventRecipients,
        timeframe: EventTimeframe,
        handler: EventHandler<C, P>,
    ) -> &mut Self {
        self.events.push(EventDecl {
            name,
            recipients,
            timeframe,
            handler: Arc::new(TypedHandler { handler }),
        });
        self
    }

    pub(crate) fn into_parts(self) -> (Vec<RequestDecl>, Vec<EventDecl>) {
        (self.requests, self.events)
    }
}

/// Typed handle to a request on one object.
pub struct Request<P> {
    object: ObjectId,
    id: u32,
    _payload: PhantomData<fn(&P)>,
}

impl<P: WireValue + 'static> Request<P> {
    pub fn new(object: ObjectId, id: u32) -> Self {
        Self {
            object,
            id,
            _payload: PhantomData,
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sends (client) or runs (server) the request. Never waits for a reply.
    pub fn invoke<I: RequestInvoker>(&self, invoker: &mut I, data: &P) -> Result<(), NetError> {
        invoker.invoke_request(self, data)
    }
}

impl<P> Clone for Request<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Request<P> {}

impl<P> fmt::Debug for Request<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("object", &self.object)
            .field("id", &self.id)
            .finish()
    }
}

/// Typed handle to an event on one object.
pub struct Event<P> {
    object: ObjectId,
    id: u32,
    _payload: PhantomData<fn(&P)>,
}

impl<P: WireValue + 'static> Event<P> {
    pub fn new(object: ObjectId, id: u32) -> Self {
        Self {
            object,
            id,
            _payload: PhantomData,
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Runs the event on the server and fans it out. Fails on a client.
    pub fn invoke<I: EventInvoker>(&self, invoker: &mut I, data: &P) -> Result<(), NetError> {
        invoker.invoke_event(self, data)
    }
}

impl<P> Clone for Event<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Event<P> {}

impl<P> fmt::Debug for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("object", &self.object)
            .field("id", &self.id)
            .finish()
    }
}

/// A peer that can carry out requests.
pub trait RequestInvoker {
    fn invoke_request<P: WireValue + 'static>(
        &mut self,
        request: &Request<P>,
        data: &P,
    ) -> Result<(), NetError>;
}

/// A peer that can carry out events.
pub trait EventInvoker {
    fn invoke_event<P: WireValue + 'static>(
        &mut self,
        event: &Event<P>,
        data: &P,
    ) -> Result<(), NetError>;
}
