//! Network objects.
//!
//! A `NetworkObject` is the unit of spawning, ownership and destruction. It
//! owns an ordered arena of components and the request/event tables built
//! from their types. Ids only ever come from the server.

use std::{any::Any, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    channel::{
        Event, EventContext, EventDecl, EventRecipients, EventTimeframe, Request, RequestContext,
        RequestDecl,
    },
    codec::{Reader, WireValue, Writer},
    error::{AuthorityError, DecodeError, FrameError, NetError, RegistryError, UnknownTargetError},
    message::{
        ComponentSnapshot, DestroyObject, Message, OwnerChanged, SpawnComponent, SpawnObject,
        UpdateObject,
    },
    networkable::{NetComponent, Networkable, NetworkableType},
    registry::{ComponentType, ComponentTypeId, Registry, TemplateId},
};

/// Connected client, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

/// Server-allocated object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Component address: owning object plus a per-object counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub object: ObjectId,
    pub local: u32,
}

impl ComponentId {
    pub fn new(object: ObjectId, local: u32) -> Self {
        Self { object, local }
    }

    /// `object << 32 | local`.
    pub fn as_u64(self) -> u64 {
        (u64::from(self.object.0) << 32) | u64::from(self.local)
    }
}

/// Who may issue requests for an object. Encoded as `0` for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Owner {
    #[default]
    Server,
    Client(ClientId),
}

impl WireValue for ClientId {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.0);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(r.read_u32()?))
    }
}

impl WireValue for ObjectId {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.0);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(r.read_u32()?))
    }
}

impl WireValue for Owner {
    fn encode(&self, w: &mut Writer) {
        match self {
            Owner::Server => w.put_u32(0),
            Owner::Client(id) => w.put_u32(id.0),
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(match r.read_u32()? {
            0 => Owner::Server,
            n => Owner::Client(ClientId(n)),
        })
    }
}

#[derive(Debug, Clone)]
struct ChannelSlot<D> {
    component: u32,
    decl: D,
}

pub struct NetworkObject {
    id: ObjectId,
    owner: Owner,
    template: TemplateId,
    dormant: bool,
    on_server: bool,
    components: Vec<NetComponent>,
    next_local: u32,
    requests: Vec<ChannelSlot<RequestDecl>>,
    events: Vec<ChannelSlot<EventDecl>>,
}

impl NetworkObject {
    /// An empty object.
    pub fn new(id: ObjectId, owner: Owner, template: TemplateId, on_server: bool) -> Self {
        Self {
            id,
            owner,
            template,
            dormant: false,
            on_server,
            components: Vec::new(),
            next_local: 0,
            requests: Vec::new(),
            events: Vec::new(),
        }
    }

    /// An object holding default instances of every component in a template.
    pub fn from_template(
        registry: &Registry,
        template: TemplateId,
        id: ObjectId,
        owner: Owner,
        on_server: bool,
    ) -> Result<Self, RegistryError> {
        let tpl = registry
            .template(template)
            .ok_or_else(|| RegistryError::UnknownTemplate(format!("#{}", template.0)))?;
        let mut obj = Self::new(id, owner, template, on_server);
        for kind in &tpl.components {
            let ty = registry
                .component_type(*kind)
                .ok_or(RegistryError::UnknownTypeId(kind.0))?;
            let local = obj.next_local;
            obj.attach(ty, local, ty.instantiate());
        }
        Ok(obj)
    }

    /// Rebuilds a replica from a spawn message.
    pub fn from_spawn(registry: &Registry, spawn: &SpawnObject) -> Result<Self, NetError> {
        if registry.template(spawn.template).is_none() {
            return Err(DecodeError::UnknownTemplate(spawn.template.0).into());
        }
        let mut obj = Self::new(spawn.object, spawn.owner, spawn.template, false);
        for snap in &spawn.components {
            obj.apply_component(registry, snap.local, snap.kind, &snap.payload)?;
        }
        Ok(obj)
    }

    fn apply_component(
        &mut self,
        registry: &Registry,
        local: u32,
        kind: ComponentTypeId,
        payload: &[u8],
    ) -> Result<ComponentId, NetError> {
        let ty = registry
            .component_type(kind)
            .ok_or(DecodeError::UnknownComponentType(kind.0))?;
        let mut component = NetComponent::new(ComponentId::new(self.id, local), kind, ty.instantiate());
        component.deserialize(payload)?;
        Ok(self.push_component(ty, component))
    }

    fn attach(&mut self, ty: &ComponentType, local: u32, inner: Box<dyn Networkable>) -> ComponentId {
        let component = NetComponent::new(ComponentId::new(self.id, local), ty.id(), inner);
        self.push_component(ty, component)
    }

    fn push_component(&mut self, ty: &ComponentType, component: NetComponent) -> ComponentId {
        let id = component.id();
        self.requests.extend(ty.requests().iter().map(|decl| ChannelSlot {
            component: id.local,
            decl: decl.clone(),
        }));
        self.events.extend(ty.events().iter().map(|decl| ChannelSlot {
            component: id.local,
            decl: decl.clone(),
        }));
        self.components.push(component);
        self.next_local = self.next_local.max(id.local + 1);
        id
    }

    /// Adds a component before the object is first replicated.
    pub fn add_component<C: NetworkableType>(
        &mut self,
        registry: &Registry,
        component: C,
    ) -> Result<ComponentId, RegistryError> {
        let ty = registry.type_of::<C>()?;
        let local = self.next_local;
        Ok(self.attach(ty, local, Box::new(component)))
    }

    /// Adds a component to a live object.
    ///
    /// The component is in the arena before the returned `SpawnComponent`
    /// frame exists, so a handler reacting to the frame can already find it.
    pub fn spawn_component<C: NetworkableType>(
        &mut self,
        registry: &Registry,
        component: C,
    ) -> Result<(ComponentId, Bytes), NetError> {
        if !self.on_server {
            return Err(AuthorityError::WrongSide("spawn_component").into());
        }
        let id = self.add_component(registry, component)?;
        let last = self
            .components
            .last_mut()
            .ok_or(UnknownTargetError::Component {
                object: self.id,
                component: id.local,
            })?;
        let payload = last.serialize_full();
        // The full payload already carries any pending changes.
        last.clear_dirty();
        let frame = SpawnComponent {
            object: self.id,
            local: id.local,
            kind: last.kind(),
            payload,
        }
        .to_frame()?;
        Ok((id, frame))
    }

    /// Replica side of `spawn_component`.
    pub fn apply_spawn_component(
        &mut self,
        registry: &Registry,
        msg: &SpawnComponent,
    ) -> Result<ComponentId, NetError> {
        if self.component_by_local(msg.local).is_some() {
            debug!(object = %self.id, local = msg.local, "component already present, applying as update");
            self.apply_update_payload(msg.local, &msg.payload)?;
            return Ok(ComponentId::new(self.id, msg.local));
        }
        self.apply_component(registry, msg.local, msg.kind, &msg.payload)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Owner) {
        self.owner = owner;
    }

    pub fn template(&self) -> TemplateId {
        self.template
    }

    pub fn is_dormant(&self) -> bool {
        self.dormant
    }

    pub fn set_dormant(&mut self, dormant: bool) {
        self.dormant = dormant;
    }

    pub fn on_server(&self) -> bool {
        self.on_server
    }

    /// True if `identity` may act as the owner.
    ///
    /// On the server, server-initiated calls are always authorised.
    pub fn is_mine(&self, identity: Owner) -> bool {
        identity == self.owner || (self.on_server && identity == Owner::Server)
    }

    pub fn components(&self) -> &[NetComponent] {
        &self.components
    }

    pub fn find_component(&self, id: ComponentId) -> Option<&NetComponent> {
        if id.object != self.id {
            return None;
        }
        self.component_by_local(id.local)
    }

    pub fn find_component_mut(&mut self, id: ComponentId) -> Option<&mut NetComponent> {
        if id.object != self.id {
            return None;
        }
        self.component_by_local_mut(id.local)
    }

    pub fn component_by_local(&self, local: u32) -> Option<&NetComponent> {
        self.components.iter().find(|c| c.id().local == local)
    }

    pub fn component_by_local_mut(&mut self, local: u32) -> Option<&mut NetComponent> {
        self.components.iter_mut().find(|c| c.id().local == local)
    }

    /// First component of type `C`.
    pub fn component<C: NetworkableType>(&self) -> Option<&C> {
        self.components.iter().find_map(|c| c.downcast_ref::<C>())
    }

    pub fn component_mut<C: NetworkableType>(&mut self) -> Option<&mut C> {
        self.components.iter_mut().find_map(|c| c.downcast_mut::<C>())
    }

    /// Looks up a request by name, checking the payload type.
    pub fn request<P: WireValue + 'static>(&self, name: &str) -> Option<Request<P>> {
        let want = std::any::TypeId::of::<P>();
        let idx = self
            .requests
            .iter()
            .position(|s| s.decl.name() == name && s.decl.payload_type() == want)?;
        Some(Request::new(self.id, idx as u32))
    }

    /// Looks up an event by name, checking the payload type.
    pub fn event<P: WireValue + 'static>(&self, name: &str) -> Option<Event<P>> {
        let want = std::any::TypeId::of::<P>();
        let idx = self
            .events
            .iter()
            .position(|s| s.decl.name() == name && s.decl.payload_type() == want)?;
        Some(Event::new(self.id, idx as u32))
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn event_policy(&self, id: u32) -> Option<(EventRecipients, EventTimeframe)> {
        self.events
            .get(id as usize)
            .map(|s| (s.decl.recipients(), s.decl.timeframe()))
    }

    fn request_target(
        &mut self,
        id: u32,
    ) -> Result<(RequestDecl, &mut NetComponent), UnknownTargetError> {
        let object = self.id;
        let slot = self
            .requests
            .get(id as usize)
            .ok_or(UnknownTargetError::Request { object, request: id })?;
        let (local, decl) = (slot.component, slot.decl.clone());
        let component = self
            .component_by_local_mut(local)
            .ok_or(UnknownTargetError::Component {
                object,
                component: local,
            })?;
        Ok((decl, component))
    }

    fn event_target(&mut self, id: u32) -> Result<(EventDecl, &mut NetComponent), UnknownTargetError> {
        let object = self.id;
        let slot = self
            .events
            .get(id as usize)
            .ok_or(UnknownTargetError::Event { object, event: id })?;
        let (local, decl) = (slot.component, slot.decl.clone());
        let component = self
            .component_by_local_mut(local)
            .ok_or(UnknownTargetError::Component {
                object,
                component: local,
            })?;
        Ok((decl, component))
    }

    /// Decodes a request payload and runs its handler.
    pub fn handle_request(
        &mut self,
        id: u32,
        payload: &[u8],
        ctx: &RequestContext,
    ) -> Result<(), NetError> {
        let (decl, component) = self.request_target(id)?;
        decl.handler().call_bytes(component.inner_mut(), payload, ctx)?;
        Ok(())
    }

    /// Runs a request handler with a typed payload.
    pub fn handle_request_local(
        &mut self,
        id: u32,
        data: &dyn Any,
        ctx: &RequestContext,
    ) -> Result<(), NetError> {
        let (decl, component) = self.request_target(id)?;
        decl.handler().call_local(component.inner_mut(), data, ctx)?;
        Ok(())
    }

    /// Decodes an event payload and runs its handler.
    pub fn handle_event(
        &mut self,
        id: u32,
        payload: &[u8],
        ctx: &EventContext,
    ) -> Result<(), NetError> {
        let (decl, component) = self.event_target(id)?;
        decl.handler().call_bytes(component.inner_mut(), payload, ctx)?;
        Ok(())
    }

    /// Runs an event handler with a typed payload.
    pub fn handle_event_local(
        &mut self,
        id: u32,
        data: &dyn Any,
        ctx: &EventContext,
    ) -> Result<(), NetError> {
        let (decl, component) = self.event_target(id)?;
        decl.handler().call_local(component.inner_mut(), data, ctx)?;
        Ok(())
    }

    /// True if any component has unsent changes.
    pub fn is_dirty(&self) -> bool {
        self.components.iter().any(NetComponent::is_dirty)
    }

    /// One `UpdateObject` frame per dirty component, in arena order.
    ///
    /// Clears the dirty state of every component it reports.
    pub fn broadcast_update(&mut self) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();
        for c in self.components.iter_mut().filter(|c| c.is_dirty()) {
            let msg = UpdateObject {
                object: self.id,
                component: c.id().local,
                payload: c.serialize_delta(),
            };
            frames.push(msg.to_frame()?);
        }
        Ok(frames)
    }

    /// Applies an `UpdateObject` addressed to this object and returns the
    /// mask of slots it wrote.
    pub fn apply_update(&mut self, msg: &UpdateObject) -> Result<u64, NetError> {
        if msg.object != self.id {
            return Err(UnknownTargetError::Object(msg.object).into());
        }
        self.apply_update_payload(msg.component, &msg.payload)
    }

    fn apply_update_payload(&mut self, local: u32, payload: &[u8]) -> Result<u64, NetError> {
        let object = self.id;
        let component = self
            .component_by_local_mut(local)
            .ok_or(UnknownTargetError::Component {
                object,
                component: local,
            })?;
        Ok(component.deserialize(payload)?)
    }

    /// Complete snapshot for a client that is not replicating this object yet.
    pub fn spawn_snapshot(&self) -> SpawnObject {
        SpawnObject {
            object: self.id,
            owner: self.owner,
            template: self.template,
            components: self
                .components
                .iter()
                .map(|c| ComponentSnapshot {
                    local: c.id().local,
                    kind: c.kind(),
                    payload: c.serialize_full(),
                })
                .collect(),
        }
    }

    pub fn spawn_message(&self) -> Result<Bytes, FrameError> {
        self.spawn_snapshot().to_frame()
    }

    pub fn destroy_message(&self) -> Result<Bytes, FrameError> {
        DestroyObject { object: self.id }.to_frame()
    }

    pub fn owner_message(&self) -> Result<Bytes, FrameError> {
        OwnerChanged {
            object: self.id,
            owner: self.owner,
        }
        .to_frame()
    }
}

impl fmt::Debug for NetworkObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkObject")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("template", &self.template)
            .field("dormant", &self.dormant)
            .field("on_server", &self.on_server)
            .field("components", &self.components)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{decode_frame, MessageType},
        demo::{demo_registry, AttackData, Capital, NetworkTransform, CORRECT_PASSWORD},
        math::Vec3,
    };

    fn server_capital(reg: &Registry) -> NetworkObject {
        let tpl = reg.template_by_name("capital").unwrap().id;
        NetworkObject::from_template(reg, tpl, ObjectId(7), Owner::Client(ClientId(1)), true)
            .unwrap()
    }

    fn payload_of(frame: &[u8], kind: MessageType) -> Vec<u8> {
        let (k, payload) = decode_frame(frame).unwrap();
        assert_eq!(k, kind as u8);
        payload.to_vec()
    }

    #[test]
    fn component_id_packs_object_and_local() {
        let id = ComponentId::new(ObjectId(3), 5);
        assert_eq!(id.as_u64(), (3u64 << 32) | 5);
    }

    #[test]
    fn owner_wire_form_uses_zero_for_server() {
        assert_eq!(&Owner::Server.to_wire()[..], &[0, 0, 0, 0]);
        assert_eq!(
            Owner::from_wire(&[0, 0, 0, 4]).unwrap(),
            Owner::Client(ClientId(4))
        );
    }

    #[test]
    fn is_mine_follows_owner() {
        let reg = demo_registry().unwrap();
        let mut obj = server_capital(&reg);
        assert!(obj.is_mine(Owner::Client(ClientId(1))));
        assert!(!obj.is_mine(Owner::Client(ClientId(2))));
        assert!(obj.is_mine(Owner::Server), "server calls are authorised");

        obj.on_server = false;
        assert!(!obj.is_mine(Owner::Server));
    }

    #[test]
    fn channel_lookup_checks_name_and_type() {
        let reg = demo_registry().unwrap();
        let obj = server_capital(&reg);
        assert!(obj.request::<AttackData>("attack").is_some());
        assert!(obj.request::<u32>("attack").is_none());
        assert!(obj.request::<AttackData>("missing").is_none());
        assert!(obj.event::<String>("alert").is_some());
    }

    #[test]
    fn request_reaches_the_declaring_component() {
        let reg = demo_registry().unwrap();
        let mut obj = server_capital(&reg);
        let req = obj.request::<AttackData>("attack").unwrap();
        let data = AttackData {
            password: CORRECT_PASSWORD,
            to_building: 12,
        };
        let ctx = RequestContext {
            object: obj.id(),
            sender: Owner::Client(ClientId(1)),
        };
        obj.handle_request(req.id(), &data.to_wire(), &ctx).unwrap();
        assert_eq!(*obj.component::<Capital>().unwrap().client_toggled.get(), 12);

        let err = obj.handle_request(99, &[], &ctx).unwrap_err();
        assert!(matches!(
            err,
            NetError::UnknownTarget(UnknownTargetError::Request { request: 99, .. })
        ));
    }

    #[test]
    fn broadcast_update_reports_only_dirty_components() {
        let reg = demo_registry().unwrap();
        let mut obj = server_capital(&reg);
        assert!(obj.broadcast_update().unwrap().is_empty());

        obj.component_mut::<Capital>().unwrap().active.set(true);
        let frames = obj.broadcast_update().unwrap();
        assert_eq!(frames.len(), 1);

        let msg = UpdateObject::from_wire(&payload_of(&frames[0], MessageType::UpdateObject)).unwrap();
        assert_eq!(msg.object, ObjectId(7));
        let capital_local = obj
            .components()
            .iter()
            .find(|c| c.downcast_ref::<Capital>().is_some())
            .unwrap()
            .id()
            .local;
        assert_eq!(msg.component, capital_local);
        assert!(obj.broadcast_update().unwrap().is_empty());
    }

    #[test]
    fn spawn_snapshot_rebuilds_an_equivalent_replica() {
        let reg = demo_registry().unwrap();
        let mut obj = server_capital(&reg);
        obj.component_mut::<Capital>().unwrap().name.set("Goodbye World".into());
        obj.component_mut::<NetworkTransform>()
            .unwrap()
            .position
            .set(Vec3::new(1.0, 2.0, 3.0));

        let frame = obj.spawn_message().unwrap();
        let spawn = SpawnObject::from_wire(&payload_of(&frame, MessageType::SpawnObject)).unwrap();
        let replica = NetworkObject::from_spawn(&reg, &spawn).unwrap();

        assert_eq!(replica.id(), obj.id());
        assert_eq!(replica.owner(), obj.owner());
        assert_eq!(replica.request_count(), obj.request_count());
        assert_eq!(replica.component::<Capital>().unwrap().name.get(), "Goodbye World");
        for (a, b) in obj.components().iter().zip(replica.components()) {
            assert_eq!(a.id(), b.id());
            assert_eq!(a.serialize_full(), b.serialize_full());
        }
        assert!(!replica.is_dirty());
    }

    #[test]
    fn spawn_component_appends_then_frames() {
        let reg = demo_registry().unwrap();
        let mut obj = server_capital(&reg);
        let before = obj.components().len();
        let (id, frame) = obj.spawn_component(&reg, NetworkTransform::default()).unwrap();
        assert_eq!(obj.components().len(), before + 1);
        assert!(obj.find_component(id).is_some());
        assert_eq!(id.local as usize, before);

        let msg = SpawnComponent::from_wire(&payload_of(&frame, MessageType::SpawnComponent)).unwrap();
        let mut replica = NetworkObject::from_spawn(&reg, &server_capital(&reg).spawn_snapshot()).unwrap();
        let applied = replica.apply_spawn_component(&reg, &msg).unwrap();
        assert_eq!(applied, id);
        assert_eq!(replica.request_count(), obj.request_count());
    }

    #[test]
    fn replicas_cannot_spawn_components() {
        let reg = demo_registry().unwrap();
        let spawn = server_capital(&reg).spawn_snapshot();
        let mut replica = NetworkObject::from_spawn(&reg, &spawn).unwrap();
        assert!(matches!(
            replica.spawn_component(&reg, NetworkTransform::default()),
            Err(NetError::Authority(AuthorityError::WrongSide(_)))
        ));
    }

    #[test]
    fn unknown_component_type_in_spawn_is_rejected() {
        let reg = demo_registry().unwrap();
        let mut spawn = server_capital(&reg).spawn_snapshot();
        spawn.components[0].kind = ComponentTypeId(42);
        assert!(matches!(
            NetworkObject::from_spawn(&reg, &spawn),
            Err(NetError::Decode(DecodeError::UnknownComponentType(42)))
        ));
    }
}
