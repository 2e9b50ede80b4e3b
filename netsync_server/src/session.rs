//! Server replication session.
//!
//! A pure state machine: decoded frames in, encoded frames out through one
//! bounded queue per client. It never performs I/O and never blocks; the
//! shell in `server` feeds it and calls `tick()` at a fixed rate.
//!
//! Client lifecycle: `Handshaking` -> `Lobby` -> `Loading` -> `InGame`.
//! A client enters `InGame` right after its late-join replay has been
//! queued, and only from then on are its requests accepted.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use bytes::Bytes;
use netsync_shared::{
    channel::{
        Event, EventContext, EventInvoker, EventRecipients, EventTimeframe, Request,
        RequestContext, RequestInvoker,
    },
    codec::{encode_frame, MessageType, RawFrame, WireValue},
    config::{DisconnectPolicy, NetConfig},
    error::{AuthorityError, DecodeError, NetError, UnknownTargetError},
    event::{EventBus, SessionEvent},
    message::{
        ChannelCall, ClientLoaded, Disconnect, GameStarted, Handshake, Message, ReplayComplete,
        Welcome, PROTOCOL_VERSION,
    },
    networkable::NetworkableType,
    object::{ClientId, ComponentId, NetworkObject, ObjectId, Owner},
    registry::Registry,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Handshaking,
    Lobby,
    Loading,
    InGame,
}

/// How the shell should tear down a dropped client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Abort both I/O tasks; queued frames are lost.
    Hard,
    /// Stop reading but let the writer flush (used to deliver `Disconnect`).
    Flush,
}

struct ClientSlot {
    phase: ClientPhase,
    outbound: mpsc::Sender<Bytes>,
    pending: VecDeque<ChannelCall>,
    broken: Option<&'static str>,
}

impl ClientSlot {
    /// Queues a frame without waiting. A full or closed queue marks the
    /// client broken; the session drops it at the end of the current step.
    fn send(&mut self, frame: Bytes) {
        if self.broken.is_some() {
            return;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.broken = Some("outbound queue full"),
            Err(TrySendError::Closed(_)) => self.broken = Some("outbound queue closed"),
        }
    }
}

struct RetainedEvent {
    recipients: EventRecipients,
    frame: Bytes,
}

struct LiveObject {
    object: NetworkObject,
    /// Clients that have received the spawn and get deltas.
    spawned_for: BTreeSet<ClientId>,
    /// Long-term events, replayed to each client that starts replicating.
    retained: Vec<RetainedEvent>,
}

fn may_receive(object: &NetworkObject, recipients: EventRecipients, client: ClientId) -> bool {
    match recipients {
        EventRecipients::Owner => object.owner() == Owner::Client(client),
        EventRecipients::ActiveClients | EventRecipients::AllClients => true,
    }
}

fn fan_out<'a>(
    clients: &mut BTreeMap<ClientId, ClientSlot>,
    targets: impl IntoIterator<Item = &'a ClientId>,
    frame: &Bytes,
) {
    for id in targets {
        if let Some(slot) = clients.get_mut(id) {
            slot.send(frame.clone());
        }
    }
}

/// Sends one object's spawn plus the retained events `client` may see.
fn start_replicating(live: &mut LiveObject, client: ClientId, slot: &mut ClientSlot, spawn: Bytes) {
    slot.send(spawn);
    for ev in &live.retained {
        if may_receive(&live.object, ev.recipients, client) {
            slot.send(ev.frame.clone());
        }
    }
    live.spawned_for.insert(client);
}

pub struct ServerSession {
    registry: Arc<Registry>,
    max_requests_per_tick: usize,
    max_pending_requests: usize,
    disconnect_policy: DisconnectPolicy,
    clients: BTreeMap<ClientId, ClientSlot>,
    objects: BTreeMap<ObjectId, LiveObject>,
    next_client: u32,
    next_object: u32,
    in_progress: bool,
    tick: u64,
    events: EventBus,
    dropped: Vec<(ClientId, DropMode)>,
}

impl ServerSession {
    pub fn new(registry: Arc<Registry>, cfg: &NetConfig) -> Self {
        Self {
            registry,
            max_requests_per_tick: cfg.max_client_requests_per_tick.max(1),
            max_pending_requests: cfg.max_pending_requests.max(1),
            disconnect_policy: cfg.disconnect_policy,
            clients: BTreeMap::new(),
            objects: BTreeMap::new(),
            next_client: 1,
            next_object: 1,
            in_progress: false,
            tick: 0,
            events: EventBus::new(),
            dropped: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn client_phase(&self, client: ClientId) -> Option<ClientPhase> {
        self.clients.get(&client).map(|s| s.phase)
    }

    /// Requests received from `client` and not handled yet.
    pub fn pending_requests(&self, client: ClientId) -> Option<usize> {
        self.clients.get(&client).map(|s| s.pending.len())
    }

    pub fn object(&self, id: ObjectId) -> Option<&NetworkObject> {
        self.objects.get(&id).map(|l| &l.object)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut NetworkObject> {
        self.objects.get_mut(&id).map(|l| &mut l.object)
    }

    /// Live objects in spawn order.
    pub fn objects(&self) -> impl Iterator<Item = &NetworkObject> + '_ {
        self.objects.values().map(|l| &l.object)
    }

    pub fn is_replicating(&self, client: ClientId, object: ObjectId) -> bool {
        self.objects
            .get(&object)
            .is_some_and(|l| l.spawned_for.contains(&client))
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain()
    }

    /// Clients removed since the last call, for the shell to tear down.
    pub fn take_dropped(&mut self) -> Vec<(ClientId, DropMode)> {
        std::mem::take(&mut self.dropped)
    }

    /// Registers a new connection. Ids are never reused.
    pub fn connect_client(&mut self, outbound: mpsc::Sender<Bytes>) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        self.clients.insert(
            id,
            ClientSlot {
                phase: ClientPhase::Handshaking,
                outbound,
                pending: VecDeque::new(),
                broken: None,
            },
        );
        info!(client_id = ?id, "client connected");
        self.events.push(SessionEvent::ClientConnected(id));
        id
    }

    fn send(&mut self, client: ClientId, frame: Bytes) {
        if let Some(slot) = self.clients.get_mut(&client) {
            slot.send(frame);
        }
    }

    fn set_phase(&mut self, client: ClientId, phase: ClientPhase) {
        if let Some(slot) = self.clients.get_mut(&client) {
            debug!(client_id = ?client, from = ?slot.phase, to = ?phase, "client phase");
            slot.phase = phase;
        }
    }

    /// Handles one frame from a client.
    ///
    /// Errors cost only this frame; the connection stays open.
    pub fn handle_frame(&mut self, client: ClientId, frame: RawFrame) -> Result<(), NetError> {
        let phase = self
            .client_phase(client)
            .ok_or(UnknownTargetError::Client(client))?;
        let kind = frame.message_type()?;

        match kind {
            MessageType::Handshake if phase == ClientPhase::Handshaking => {
                let hs = Handshake::from_wire(&frame.payload)?;
                if hs.protocol != PROTOCOL_VERSION {
                    warn!(client_id = ?client, protocol = hs.protocol, "protocol mismatch");
                    self.kick(client, "protocol version mismatch")?;
                    return Ok(());
                }
                self.send(client, Welcome { client }.to_frame()?);
                self.set_phase(client, ClientPhase::Lobby);
                if self.in_progress {
                    self.send(client, GameStarted.to_frame()?);
                    self.set_phase(client, ClientPhase::Loading);
                }
            }
            MessageType::ClientLoaded if phase == ClientPhase::Loading => {
                ClientLoaded::from_wire(&frame.payload)?;
                self.replay_to(client)?;
            }
            MessageType::ClientRequest => {
                if phase != ClientPhase::InGame {
                    return Err(AuthorityError::NotJoined.into());
                }
                let call = ChannelCall::decode_as(MessageType::ClientRequest, &frame.payload)?;
                let limit = self.max_pending_requests;
                if let Some(slot) = self.clients.get_mut(&client) {
                    if slot.pending.len() >= limit {
                        slot.broken = Some("request queue full");
                    } else {
                        slot.pending.push_back(call);
                    }
                }
            }
            MessageType::Debug => {
                self.send(client, encode_frame(MessageType::Debug, &frame.payload)?);
            }
            MessageType::Disconnect => {
                let reason = Disconnect::from_wire(&frame.payload)
                    .map(|d| d.reason)
                    .unwrap_or_else(|_| "client left".to_string());
                self.disconnect_client(client, &reason);
            }
            other => return Err(DecodeError::UnexpectedMessageType(other.into()).into()),
        }

        self.reap_broken();
        Ok(())
    }

    /// Every live object's spawn, in spawn order, each followed by its
    /// retained events, then `ReplayComplete`.
    fn replay_to(&mut self, client: ClientId) -> Result<(), NetError> {
        let Self {
            objects, clients, ..
        } = self;
        let slot = clients
            .get_mut(&client)
            .ok_or(UnknownTargetError::Client(client))?;

        let mut replayed = 0usize;
        for live in objects.values_mut() {
            let spawn = match live.object.spawn_message() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(object = %live.object.id(), error = %e, "object does not fit in a frame");
                    continue;
                }
            };
            start_replicating(live, client, slot, spawn);
            replayed += 1;
        }
        slot.send(ReplayComplete.to_frame()?);
        slot.phase = ClientPhase::InGame;

        info!(client_id = ?client, objects = replayed, "replay complete");
        self.events.push(SessionEvent::ClientJoinedGame(client));
        Ok(())
    }

    /// Moves the session from lobby to in-progress.
    pub fn start_game(&mut self) -> Result<(), NetError> {
        if self.in_progress {
            return Ok(());
        }
        self.in_progress = true;
        let frame = GameStarted.to_frame()?;
        for slot in self
            .clients
            .values_mut()
            .filter(|s| s.phase == ClientPhase::Lobby)
        {
            slot.send(frame.clone());
            slot.phase = ClientPhase::Loading;
        }
        info!(clients = self.clients.len(), "game started");
        self.reap_broken();
        Ok(())
    }

    /// Drops a client at once. Its queued frames are discarded.
    pub fn disconnect_client(&mut self, client: ClientId, reason: &str) -> bool {
        self.remove_client(client, reason, DropMode::Hard)
    }

    /// Tells a client why it is being dropped, then drops it.
    pub fn kick(&mut self, client: ClientId, reason: &str) -> Result<(), NetError> {
        if !self.clients.contains_key(&client) {
            return Err(UnknownTargetError::Client(client).into());
        }
        let frame = Disconnect {
            reason: reason.to_string(),
        }
        .to_frame()?;
        self.send(client, frame);
        self.remove_client(client, reason, DropMode::Flush);
        Ok(())
    }

    fn remove_client(&mut self, client: ClientId, reason: &str, mode: DropMode) -> bool {
        if self.clients.remove(&client).is_none() {
            return false;
        }
        for live in self.objects.values_mut() {
            live.spawned_for.remove(&client);
        }

        let owned: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, l)| l.object.owner() == Owner::Client(client))
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            let result = match self.disconnect_policy {
                DisconnectPolicy::Orphan => self.set_owner(id, Owner::Server),
                DisconnectPolicy::Destroy => self.destroy_object(id),
            };
            if let Err(e) = result {
                warn!(object = %id, error = %e, "cleanup of disconnected client's object failed");
            }
        }

        self.dropped.push((client, mode));
        info!(client_id = ?client, %reason, "client disconnected");
        self.events.push(SessionEvent::ClientDisconnected {
            client,
            reason: reason.to_string(),
        });
        true
    }

    /// Drops every client whose queue overflowed or closed.
    fn reap_broken(&mut self) {
        loop {
            let Some((id, reason)) = self
                .clients
                .iter()
                .find_map(|(id, s)| s.broken.map(|r| (*id, r)))
            else {
                break;
            };
            warn!(client_id = ?id, reason, "dropping slow or gone client");
            self.remove_client(id, reason, DropMode::Hard);
        }
    }

    /// Creates an object from a named template. It reaches in-game clients
    /// on the next tick.
    pub fn spawn_object(&mut self, template: &str, owner: Owner) -> Result<ObjectId, NetError> {
        let tpl = self.registry.template_by_name(template)?.id;
        let id = ObjectId(self.next_object);
        let object = NetworkObject::from_template(&self.registry, tpl, id, owner, true)?;
        self.next_object += 1;
        self.objects.insert(
            id,
            LiveObject {
                object,
                spawned_for: BTreeSet::new(),
                retained: Vec::new(),
            },
        );
        debug!(object = %id, template, ?owner, "object spawned");
        Ok(id)
    }

    pub fn destroy_object(&mut self, id: ObjectId) -> Result<(), NetError> {
        let live = self
            .objects
            .remove(&id)
            .ok_or(UnknownTargetError::Object(id))?;
        let frame = live.object.destroy_message()?;
        fan_out(&mut self.clients, &live.spawned_for, &frame);
        debug!(object = %id, "object destroyed");
        self.reap_broken();
        Ok(())
    }

    pub fn set_dormant(&mut self, id: ObjectId, dormant: bool) -> Result<(), NetError> {
        let live = self
            .objects
            .get_mut(&id)
            .ok_or(UnknownTargetError::Object(id))?;
        live.object.set_dormant(dormant);
        Ok(())
    }

    pub fn set_owner(&mut self, id: ObjectId, owner: Owner) -> Result<(), NetError> {
        let live = self
            .objects
            .get_mut(&id)
            .ok_or(UnknownTargetError::Object(id))?;
        live.object.set_owner(owner);
        let frame = live.object.owner_message()?;
        fan_out(&mut self.clients, &live.spawned_for, &frame);
        debug!(object = %id, ?owner, "owner changed");
        self.reap_broken();
        Ok(())
    }

    /// Adds a component to a live object and tells replicating clients.
    pub fn spawn_component<C: NetworkableType>(
        &mut self,
        id: ObjectId,
        component: C,
    ) -> Result<ComponentId, NetError> {
        let live = self
            .objects
            .get_mut(&id)
            .ok_or(UnknownTargetError::Object(id))?;
        let (component_id, frame) = live.object.spawn_component(&self.registry, component)?;
        fan_out(&mut self.clients, &live.spawned_for, &frame);
        self.reap_broken();
        Ok(component_id)
    }

    /// One replication step.
    ///
    /// For every object in spawn order: take its deltas once, send them to
    /// clients already replicating it, and send a full spawn to in-game
    /// clients that are not. Then run queued requests.
    pub fn tick(&mut self) {
        self.tick += 1;
        let Self {
            objects, clients, ..
        } = self;

        for live in objects.values_mut() {
            let deltas = live.object.broadcast_update().unwrap_or_else(|e| {
                warn!(object = %live.object.id(), error = %e, "dropping oversized update");
                Vec::new()
            });

            let mut spawn = None;
            for (id, slot) in clients
                .iter_mut()
                .filter(|(_, s)| s.phase == ClientPhase::InGame)
            {
                if live.spawned_for.contains(id) {
                    for frame in &deltas {
                        slot.send(frame.clone());
                    }
                    continue;
                }
                if spawn.is_none() {
                    spawn = match live.object.spawn_message() {
                        Ok(frame) => Some(frame),
                        Err(e) => {
                            warn!(object = %live.object.id(), error = %e, "object does not fit in a frame");
                            break;
                        }
                    };
                }
                if let Some(frame) = &spawn {
                    start_replicating(live, *id, slot, frame.clone());
                }
            }
        }

        self.process_requests();
        self.reap_broken();
    }

    fn process_requests(&mut self) {
        let cap = self.max_requests_per_tick;
        let mut batch = Vec::new();
        for (id, slot) in self.clients.iter_mut() {
            let n = slot.pending.len().min(cap);
            if slot.pending.len() > cap {
                debug!(client_id = ?id, deferred = slot.pending.len() - cap, "request cap reached");
            }
            batch.extend(slot.pending.drain(..n).map(|call| (*id, call)));
        }

        for (client, call) in batch {
            if let Err(e) = self.apply_request(client, &call) {
                warn!(
                    client_id = ?client,
                    object = %call.object,
                    request = call.id,
                    error = %e,
                    "request rejected"
                );
            }
        }
    }

    /// Authority checks, then the handler.
    fn apply_request(&mut self, client: ClientId, call: &ChannelCall) -> Result<(), NetError> {
        let live = self
            .objects
            .get_mut(&call.object)
            .ok_or(UnknownTargetError::Object(call.object))?;
        let sender = Owner::Client(client);
        if live.object.is_dormant() {
            return Err(AuthorityError::Dormant(call.object).into());
        }
        if !live.object.is_mine(sender) {
            return Err(AuthorityError::NotOwner {
                client,
                object: call.object,
            }
            .into());
        }
        live.object.handle_request(
            call.id,
            &call.payload,
            &RequestContext {
                object: call.object,
                sender,
            },
        )
    }
}

impl RequestInvoker for ServerSession {
    /// Server-side requests run the handler directly, without serializing.
    fn invoke_request<P: WireValue + 'static>(
        &mut self,
        request: &Request<P>,
        data: &P,
    ) -> Result<(), NetError> {
        let object = request.object();
        let live = self
            .objects
            .get_mut(&object)
            .ok_or(UnknownTargetError::Object(object))?;
        live.object.handle_request_local(
            request.id(),
            data,
            &RequestContext {
                object,
                sender: Owner::Server,
            },
        )
    }
}

impl EventInvoker for ServerSession {
    fn invoke_event<P: WireValue + 'static>(
        &mut self,
        event: &Event<P>,
        data: &P,
    ) -> Result<(), NetError> {
        let object = event.object();
        let Self {
            objects, clients, ..
        } = self;
        let live = objects
            .get_mut(&object)
            .ok_or(UnknownTargetError::Object(object))?;
        let (recipients, timeframe) =
            live.object
                .event_policy(event.id())
                .ok_or(UnknownTargetError::Event {
                    object,
                    event: event.id(),
                })?;

        let owner = live.object.owner();
        let owner_only = recipients == EventRecipients::Owner && owner != Owner::Server;
        if !owner_only {
            live.object.handle_event_local(
                event.id(),
                data,
                &EventContext {
                    object,
                    on_server: true,
                },
            )?;
        }

        let frame = ChannelCall::event(object, event.id(), data.to_wire()).to_frame()?;
        let retained = timeframe == EventTimeframe::LongTermDelayable;
        if retained {
            live.retained.push(RetainedEvent {
                recipients,
                frame: frame.clone(),
            });
        }

        // Retained events reach non-replicating clients through replay only.
        let targets: Vec<ClientId> = match recipients {
            EventRecipients::ActiveClients => live.spawned_for.iter().copied().collect(),
            EventRecipients::Owner => match owner {
                Owner::Client(c) if live.spawned_for.contains(&c) => vec![c],
                _ => Vec::new(),
            },
            EventRecipients::AllClients if retained => live.spawned_for.iter().copied().collect(),
            EventRecipients::AllClients => clients
                .iter()
                .filter(|(_, s)| s.phase != ClientPhase::Handshaking)
                .map(|(id, _)| *id)
                .collect(),
        };
        fan_out(clients, &targets, &frame);
        self.reap_broken();
        Ok(())
    }
}
