//! Demo component types.
//!
//! Used by the binaries and the tests. `Capital` carries a password-guarded
//! request and a few events; `NetworkTransform` stands in for the scene
//! transform collaborator.

use crate::{
    channel::{Channels, EventContext, EventRecipients, EventTimeframe, RequestContext},
    codec::{Reader, WireValue, Writer},
    error::{DecodeError, RegistryError},
    math::{Quat, Vec3},
    networkable::{Networkable, NetworkableType},
    registry::Registry,
    sync_var::{SyncField, SyncVar},
};

pub const CORRECT_PASSWORD: i32 = 4242;
pub const INCORRECT_PASSWORD: i32 = CORRECT_PASSWORD + 1;

/// Payload of `Capital`'s `attack` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttackData {
    pub password: i32,
    pub to_building: i32,
}

impl WireValue for AttackData {
    fn encode(&self, w: &mut Writer) {
        self.password.encode(w);
        self.to_building.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            password: r.read()?,
            to_building: r.read()?,
        })
    }
}

#[derive(Debug)]
pub struct Capital {
    pub active: SyncVar<bool>,
    pub name: SyncVar<String>,
    pub client_toggled: SyncVar<i32>,
    /// Local only: every `alert` event applied here.
    pub alerts: Vec<String>,
    /// Local only: count of `ping` events applied here.
    pub pings: u32,
    /// Local only: count of `owner_notice` events applied here.
    pub notices: u32,
}

impl Default for Capital {
    fn default() -> Self {
        Self {
            active: SyncVar::new(false),
            name: SyncVar::new("Hello World".to_string()),
            client_toggled: SyncVar::new(0),
            alerts: Vec::new(),
            pings: 0,
            notices: 0,
        }
    }
}

impl Networkable for Capital {
    fn slots(&self) -> Vec<&dyn SyncField> {
        vec![&self.active, &self.name, &self.client_toggled]
    }

    fn slots_mut(&mut self) -> Vec<&mut dyn SyncField> {
        vec![&mut self.active, &mut self.name, &mut self.client_toggled]
    }
}

impl Capital {
    fn on_attack(&mut self, data: &AttackData, _ctx: &RequestContext) {
        if data.password == CORRECT_PASSWORD {
            self.client_toggled.set(data.to_building);
        }
    }

    fn on_alert(&mut self, text: &String, _ctx: &EventContext) {
        self.alerts.push(text.clone());
    }

    fn on_ping(&mut self, _: &(), _ctx: &EventContext) {
        self.pings += 1;
    }

    fn on_owner_notice(&mut self, _: &u32, _ctx: &EventContext) {
        self.notices += 1;
    }
}

impl NetworkableType for Capital {
    const TYPE_NAME: &'static str = "capital";

    fn declare_channels(channels: &mut Channels<Self>) {
        channels
            .request("attack", Self::on_attack)
            .event(
                "alert",
                EventRecipients::ActiveClients,
                EventTimeframe::LongTermDelayable,
                Self::on_alert,
            )
            .event(
                "ping",
                EventRecipients::AllClients,
                EventTimeframe::Instant,
                Self::on_ping,
            )
            .event(
                "owner_notice",
                EventRecipients::Owner,
                EventTimeframe::LongTermDelayable,
                Self::on_owner_notice,
            );
    }
}

#[derive(Debug)]
pub struct NetworkTransform {
    pub position: SyncVar<Vec3>,
    pub rotation: SyncVar<Quat>,
    pub scale: SyncVar<Vec3>,
}

impl Default for NetworkTransform {
    fn default() -> Self {
        Self {
            position: SyncVar::new(Vec3::ZERO),
            rotation: SyncVar::new(Quat::IDENTITY),
            scale: SyncVar::new(Vec3::ONE),
        }
    }
}

impl Networkable for NetworkTransform {
    fn slots(&self) -> Vec<&dyn SyncField> {
        vec![&self.position, &self.rotation, &self.scale]
    }

    fn slots_mut(&mut self) -> Vec<&mut dyn SyncField> {
        vec![&mut self.position, &mut self.rotation, &mut self.scale]
    }
}

impl NetworkTransform {
    fn on_teleport(&mut self, to: &Vec3, _ctx: &RequestContext) {
        self.position.set(*to);
    }
}

impl NetworkableType for NetworkTransform {
    const TYPE_NAME: &'static str = "network_transform";

    fn declare_channels(channels: &mut Channels<Self>) {
        channels.request("teleport", Self::on_teleport);
    }
}

/// Registry with both demo types and the `capital` and `unit` templates.
pub fn demo_registry() -> Result<Registry, RegistryError> {
    let mut reg = Registry::new();
    let transform = reg.register::<NetworkTransform>()?;
    let capital = reg.register::<Capital>()?;
    reg.register_template("capital", &[transform, capital])?;
    reg.register_template("unit", &[transform])?;
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_lists_are_fixed() {
        let c = Capital::default();
        assert_eq!(c.slots().len(), 3);
        let t = NetworkTransform::default();
        assert_eq!(t.slots().len(), 3);
        assert_eq!(*t.rotation.get(), Quat::IDENTITY);
    }

    #[test]
    fn wrong_password_changes_nothing() {
        let mut c = Capital::default();
        let ctx = RequestContext {
            object: crate::object::ObjectId(1),
            sender: crate::object::Owner::Server,
        };
        c.on_attack(
            &AttackData {
                password: INCORRECT_PASSWORD,
                to_building: 3,
            },
            &ctx,
        );
        assert_eq!(*c.client_toggled.get(), 0);
        c.on_attack(
            &AttackData {
                password: CORRECT_PASSWORD,
                to_building: 3,
            },
            &ctx,
        );
        assert_eq!(*c.client_toggled.get(), 3);
    }

    #[test]
    fn demo_registry_layout() {
        let reg = demo_registry().unwrap();
        let capital = reg.template_by_name("capital").unwrap();
        assert_eq!(capital.components.len(), 2);
        assert_eq!(reg.type_of::<Capital>().unwrap().events().len(), 3);
    }
}
