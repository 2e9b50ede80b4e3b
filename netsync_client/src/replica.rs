//! Client-side replica of the server's objects.
//!
//! Like the server session this does no I/O: the shell in `client` hands it
//! decoded frames, and outgoing frames go into a bounded queue the writer
//! task drains.

use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use netsync_shared::{
    channel::{Event, EventContext, EventInvoker, Request, RequestInvoker},
    codec::{MessageType, RawFrame, WireValue},
    error::{AuthorityError, DecodeError, NetError, UnknownTargetError},
    event::{ClientEvent, ConnectionState, EventBus},
    message::{
        ChannelCall, ClientLoaded, DestroyObject, Disconnect, GameStarted, Handshake, Message,
        OwnerChanged, ReplayComplete, SpawnComponent, SpawnObject, UpdateObject, Welcome,
        PROTOCOL_VERSION,
    },
    object::{ClientId, ComponentId, NetworkObject, ObjectId, Owner},
    registry::Registry,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub struct ClientReplica {
    registry: Arc<Registry>,
    state: ConnectionState,
    client_id: Option<ClientId>,
    objects: BTreeMap<ObjectId, NetworkObject>,
    outbound: mpsc::Sender<Bytes>,
    events: EventBus,
}

impl ClientReplica {
    pub fn new(registry: Arc<Registry>, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            registry,
            state: ConnectionState::Connecting,
            client_id: None,
            objects: BTreeMap::new(),
            outbound,
            events: EventBus::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Assigned by the server's `Welcome`.
    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn object(&self, id: ObjectId) -> Option<&NetworkObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut NetworkObject> {
        self.objects.get_mut(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &NetworkObject> + '_ {
        self.objects.values()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = ?self.state, to = ?state, "connection state");
        self.state = state;
        self.events.push(ClientEvent::StateChanged(state));
    }

    fn send(&mut self, frame: Bytes) -> Result<(), NetError> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(NetError::QueueFull(self.client_id.unwrap_or(ClientId(0))))
            }
            Err(TrySendError::Closed(_)) => Err(NetError::Closed),
        }
    }

    pub fn send_handshake(&mut self) -> Result<(), NetError> {
        let frame = Handshake {
            protocol: PROTOCOL_VERSION,
        }
        .to_frame()?;
        self.send(frame)
    }

    /// Asks the server to drop this client.
    pub fn send_disconnect(&mut self, reason: &str) -> Result<(), NetError> {
        let frame = Disconnect {
            reason: reason.to_string(),
        }
        .to_frame()?;
        self.send(frame)?;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// The transport is gone.
    pub fn connection_lost(&mut self, reason: &str) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::ConnectionFailed => return,
            ConnectionState::Connecting => self.set_state(ConnectionState::ConnectionFailed),
            _ => self.set_state(ConnectionState::Disconnected),
        }
        info!(%reason, "connection lost");
    }

    fn object_entry(&mut self, id: ObjectId) -> Result<&mut NetworkObject, NetError> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| UnknownTargetError::Object(id).into())
    }

    /// Applies one frame from the server.
    pub fn handle_frame(&mut self, frame: RawFrame) -> Result<(), NetError> {
        let kind = frame.message_type()?;
        let payload = &frame.payload;

        match kind {
            MessageType::Welcome if self.state == ConnectionState::Connecting => {
                let welcome = Welcome::from_wire(payload)?;
                info!(client_id = ?welcome.client, "Connected to server");
                self.client_id = Some(welcome.client);
                self.set_state(ConnectionState::JoinedLobby);
            }
            MessageType::GameStarted => {
                GameStarted::from_wire(payload)?;
                self.objects.clear();
                self.set_state(ConnectionState::LoadingGame);
                self.send(ClientLoaded.to_frame()?)?;
            }
            MessageType::SpawnObject => {
                let spawn = SpawnObject::from_wire(payload)?;
                let object = NetworkObject::from_spawn(&self.registry, &spawn)?;
                let template = self
                    .registry
                    .template(spawn.template)
                    .map(|t| t.name.clone())
                    .unwrap_or_default();
                if self.objects.insert(spawn.object, object).is_some() {
                    warn!(object = %spawn.object, "spawn replaced an existing replica");
                }
                self.events.push(ClientEvent::ObjectSpawned {
                    object: spawn.object,
                    template,
                });
            }
            MessageType::SpawnComponent => {
                let msg = SpawnComponent::from_wire(payload)?;
                let registry = Arc::clone(&self.registry);
                self.object_entry(msg.object)?
                    .apply_spawn_component(&registry, &msg)?;
            }
            MessageType::UpdateObject => {
                let msg = UpdateObject::from_wire(payload)?;
                let mask = self.object_entry(msg.object)?.apply_update(&msg)?;
                if mask != 0 {
                    self.events.push(ClientEvent::ObjectUpdated {
                        component: ComponentId::new(msg.object, msg.component),
                        mask,
                    });
                }
            }
            MessageType::OwnerChanged => {
                let msg = OwnerChanged::from_wire(payload)?;
                self.object_entry(msg.object)?.set_owner(msg.owner);
            }
            MessageType::DestroyObject => {
                let msg = DestroyObject::from_wire(payload)?;
                self.objects
                    .remove(&msg.object)
                    .ok_or(UnknownTargetError::Object(msg.object))?;
                self.events.push(ClientEvent::ObjectDestroyed(msg.object));
            }
            MessageType::ServerEvent => {
                let call = ChannelCall::decode_as(MessageType::ServerEvent, payload)?;
                let ctx = EventContext {
                    object: call.object,
                    on_server: false,
                };
                self.object_entry(call.object)?
                    .handle_event(call.id, &call.payload, &ctx)?;
            }
            MessageType::ReplayComplete => {
                ReplayComplete::from_wire(payload)?;
                info!(objects = self.objects.len(), "Joined game");
                self.set_state(ConnectionState::JoinedGame);
            }
            MessageType::Disconnect => {
                let msg = Disconnect::from_wire(payload)?;
                info!(reason = %msg.reason, "Disconnected by server");
                self.set_state(ConnectionState::Disconnected);
            }
            MessageType::Debug => {
                debug!(len = payload.len(), "debug frame from server");
            }
            other => return Err(DecodeError::UnexpectedMessageType(other.into()).into()),
        }
        Ok(())
    }
}

impl RequestInvoker for ClientReplica {
    /// Sends a request to the server if this client owns the object.
    fn invoke_request<P: WireValue + 'static>(
        &mut self,
        request: &Request<P>,
        data: &P,
    ) -> Result<(), NetError> {
        if self.state != ConnectionState::JoinedGame {
            return Err(AuthorityError::NotJoined.into());
        }
        let client = self.client_id.ok_or(AuthorityError::NotJoined)?;
        let id = request.object();
        let object = self
            .objects
            .get(&id)
            .ok_or(UnknownTargetError::Object(id))?;
        if !object.is_mine(Owner::Client(client)) {
            warn!(object = %id, request = request.id(), "request on an object this client does not own");
            return Err(AuthorityError::NotOwner { client, object: id }.into());
        }
        let frame = ChannelCall::request(id, request.id(), data.to_wire()).to_frame()?;
        self.send(frame)
    }
}

impl EventInvoker for ClientReplica {
    fn invoke_event<P: WireValue + 'static>(
        &mut self,
        _event: &Event<P>,
        _data: &P,
    ) -> Result<(), NetError> {
        Err(AuthorityError::WrongSide("events are raised by the server").into())
    }
}
