//! Component type and template registry.
//!
//! Both peers build the same registry at startup. Registration order assigns
//! the numeric ids that go on the wire, so identical registration code means
//! identical layouts on every peer.

use std::{any::TypeId, collections::HashMap, fmt};

use crate::{
    channel::{Channels, EventDecl, RequestDecl},
    codec::{Reader, WireValue, Writer},
    error::{DecodeError, RegistryError},
    networkable::{Networkable, NetworkableType, MAX_SLOTS},
};

/// Wire id of a registered component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u16);

/// Wire id of a registered template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub u16);

impl WireValue for ComponentTypeId {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.0);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(r.read_u16()?))
    }
}

impl WireValue for TemplateId {
    fn encode(&self, w: &mut Writer) {
        w.put_u16(self.0);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(r.read_u16()?))
    }
}

fn make<C: NetworkableType>() -> Box<dyn Networkable> {
    Box::new(C::default())
}

/// A registered component type.
pub struct ComponentType {
    id: ComponentTypeId,
    name: &'static str,
    rust_type: TypeId,
    slot_count: usize,
    factory: fn() -> Box<dyn Networkable>,
    requests: Vec<RequestDecl>,
    events: Vec<EventDecl>,
}

impl ComponentType {
    pub fn id(&self) -> ComponentTypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn requests(&self) -> &[RequestDecl] {
        &self.requests
    }

    pub fn events(&self) -> &[EventDecl] {
        &self.events
    }

    /// A default-initialized instance.
    pub fn instantiate(&self) -> Box<dyn Networkable> {
        (self.factory)()
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentType")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("slot_count", &self.slot_count)
            .field("requests", &self.requests)
            .field("events", &self.events)
            .finish()
    }
}

/// Named, ordered list of component types an object is spawned with.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub components: Vec<ComponentTypeId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    types: Vec<ComponentType>,
    by_rust_type: HashMap<TypeId, ComponentTypeId>,
    templates: Vec<Template>,
    by_name: HashMap<String, TemplateId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component type and collects its channel declarations.
    pub fn register<C: NetworkableType>(&mut self) -> Result<ComponentTypeId, RegistryError> {
        let rust_type = TypeId::of::<C>();
        if self.by_rust_type.contains_key(&rust_type)
            || self.types.iter().any(|t| t.name == C::TYPE_NAME)
        {
            return Err(RegistryError::DuplicateType(C::TYPE_NAME));
        }

        let slot_count = C::default().slots().len();
        if slot_count > MAX_SLOTS {
            return Err(RegistryError::TooManySlots {
                name: C::TYPE_NAME,
                slots: slot_count,
                max: MAX_SLOTS,
            });
        }

        let mut channels = Channels::<C>::new();
        C::declare_channels(&mut channels);
        let (requests, events) = channels.into_parts();
        let names = requests
            .iter()
            .map(RequestDecl::name)
            .chain(events.iter().map(EventDecl::name));
        let mut seen = Vec::new();
        for name in names {
            if seen.contains(&name) {
                return Err(RegistryError::DuplicateChannel {
                    component: C::TYPE_NAME,
                    channel: name,
                });
            }
            seen.push(name);
        }

        let id = ComponentTypeId(self.types.len() as u16);
        self.types.push(ComponentType {
            id,
            name: C::TYPE_NAME,
            rust_type,
            slot_count,
            factory: make::<C>,
            requests,
            events,
        });
        self.by_rust_type.insert(rust_type, id);
        Ok(id)
    }

    /// Registers a template made of already registered types.
    pub fn register_template(
        &mut self,
        name: &str,
        components: &[ComponentTypeId],
    ) -> Result<TemplateId, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateTemplate(name.to_string()));
        }
        if let Some(missing) = components.iter().find(|c| self.component_type(**c).is_none()) {
            return Err(RegistryError::UnknownTypeId(missing.0));
        }

        let id = TemplateId(self.templates.len() as u16);
        self.templates.push(Template {
            id,
            name: name.to_string(),
            components: components.to_vec(),
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn component_type(&self, id: ComponentTypeId) -> Option<&ComponentType> {
        self.types.get(id.0 as usize)
    }

    /// Looks a type up by its Rust type.
    pub fn type_of<C: NetworkableType>(&self) -> Result<&ComponentType, RegistryError> {
        self.by_rust_type
            .get(&TypeId::of::<C>())
            .and_then(|id| self.component_type(*id))
            .filter(|t| t.rust_type == TypeId::of::<C>())
            .ok_or(RegistryError::UnknownType(C::TYPE_NAME))
    }

    pub fn template(&self, id: TemplateId) -> Option<&Template> {
        self.templates.get(id.0 as usize)
    }

    pub fn template_by_name(&self, name: &str) -> Result<&Template, RegistryError> {
        self.by_name
            .get(name)
            .and_then(|id| self.template(*id))
            .ok_or_else(|| RegistryError::UnknownTemplate(name.to_string()))
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn component_types(&self) -> &[ComponentType] {
        &self.types
    }
}
