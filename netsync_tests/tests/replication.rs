//! In-memory replication tests: a `ServerSession` and several
//! `ClientReplica`s wired together with queues, no sockets.

use std::sync::Arc;

use bytes::Bytes;
use netsync_client::ClientReplica;
use netsync_server::ServerSession;
use netsync_shared::{
    codec::{decode_frame, RawFrame, WireValue},
    config::{DisconnectPolicy, NetConfig},
    demo::{demo_registry, AttackData, Capital, NetworkTransform, CORRECT_PASSWORD},
    error::{AuthorityError, NetError},
    event::{ClientEvent, ConnectionState},
    math::Vec3,
    message::{ChannelCall, Message},
    object::{ClientId, ComponentId, NetworkObject, ObjectId, Owner},
    registry::Registry,
};
use tokio::sync::mpsc;

fn raw(bytes: &Bytes) -> RawFrame {
    let (kind, payload) = decode_frame(bytes).expect("well-formed frame");
    RawFrame {
        kind,
        payload: Bytes::copy_from_slice(payload),
    }
}

struct Peer {
    id: ClientId,
    replica: ClientReplica,
    /// Server to client.
    down: mpsc::Receiver<Bytes>,
    /// Client to server.
    up: mpsc::Receiver<Bytes>,
}

struct Harness {
    registry: Arc<Registry>,
    session: ServerSession,
    peers: Vec<Peer>,
}

impl Harness {
    fn new(cfg: NetConfig) -> Self {
        let registry = Arc::new(demo_registry().unwrap());
        Self {
            session: ServerSession::new(Arc::clone(&registry), &cfg),
            registry,
            peers: Vec::new(),
        }
    }

    fn started() -> Self {
        let mut h = Self::new(NetConfig::default());
        h.session.start_game().unwrap();
        h
    }

    /// Connects a client and moves frames until nothing is in flight.
    fn connect(&mut self) -> usize {
        let (down_tx, down) = mpsc::channel(1024);
        let (up_tx, up) = mpsc::channel(1024);
        let id = self.session.connect_client(down_tx);
        let mut replica = ClientReplica::new(Arc::clone(&self.registry), up_tx);
        replica.send_handshake().unwrap();
        self.peers.push(Peer {
            id,
            replica,
            down,
            up,
        });
        self.pump();
        self.peers.len() - 1
    }

    fn pump(&mut self) {
        loop {
            let mut moved = 0;
            for p in &mut self.peers {
                while let Ok(bytes) = p.up.try_recv() {
                    moved += 1;
                    let _ = self.session.handle_frame(p.id, raw(&bytes));
                }
                while let Ok(bytes) = p.down.try_recv() {
                    moved += 1;
                    p.replica.handle_frame(raw(&bytes)).unwrap();
                }
            }
            if moved == 0 {
                break;
            }
        }
    }

    fn tick(&mut self) {
        self.session.tick();
        self.pump();
    }

    fn server_object(&self, id: ObjectId) -> &NetworkObject {
        self.session.object(id).unwrap()
    }

    fn replica_object(&self, peer: usize, id: ObjectId) -> &NetworkObject {
        self.peers[peer].replica.object(id).unwrap()
    }
}

fn assert_same_state(server: &NetworkObject, replica: &NetworkObject) {
    assert_eq!(server.owner(), replica.owner());
    assert_eq!(server.template(), replica.template());
    assert_eq!(server.components().len(), replica.components().len());
    for (a, b) in server.components().iter().zip(replica.components()) {
        assert_eq!(a.id(), b.id());
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.serialize_full(), b.serialize_full(), "component {:?}", a.id());
    }
}

#[test]
fn clients_reach_joined_game_in_order() {
    let mut h = Harness::started();
    let p = h.connect();
    let events = h.peers[p].replica.drain_events();
    assert_eq!(
        events,
        vec![
            ClientEvent::StateChanged(ConnectionState::JoinedLobby),
            ClientEvent::StateChanged(ConnectionState::LoadingGame),
            ClientEvent::StateChanged(ConnectionState::JoinedGame),
        ]
    );
    assert_eq!(h.peers[p].replica.client_id(), Some(ClientId(1)));
}

#[test]
fn late_joiner_matches_early_joiner() {
    let mut h = Harness::started();
    let early = h.connect();

    let capital = h.session.spawn_object("capital", Owner::Server).unwrap();
    let unit = h.session.spawn_object("unit", Owner::Server).unwrap();
    h.tick();

    {
        let obj = h.session.object_mut(capital).unwrap();
        let c = obj.component_mut::<Capital>().unwrap();
        c.name.set("Rome".into());
        c.active.set(true);
    }
    h.tick();
    let teleport = h
        .server_object(unit)
        .request::<Vec3>("teleport")
        .unwrap();
    teleport
        .invoke(&mut h.session, &Vec3::new(3.0, 0.0, -1.0))
        .unwrap();
    let alert = h.server_object(capital).event::<String>("alert").unwrap();
    alert.invoke(&mut h.session, &"walls breached".to_string()).unwrap();
    h.tick();

    let late = h.connect();
    h.tick();

    for id in [capital, unit] {
        assert_same_state(h.server_object(id), h.replica_object(early, id));
        assert_same_state(h.server_object(id), h.replica_object(late, id));
    }
    for peer in [early, late] {
        let c = h.replica_object(peer, capital).component::<Capital>().unwrap();
        assert_eq!(c.alerts, vec!["walls breached".to_string()]);
        assert_eq!(c.name.get(), "Rome");
    }
}

#[test]
fn owner_requests_round_trip_and_others_are_refused() {
    let mut h = Harness::started();
    let owner = h.connect();
    let other = h.connect();
    let owner_id = h.peers[owner].id;
    let capital = h
        .session
        .spawn_object("capital", Owner::Client(owner_id))
        .unwrap();
    h.tick();

    let attack = h
        .replica_object(other, capital)
        .request::<AttackData>("attack")
        .unwrap();
    let data = AttackData {
        password: CORRECT_PASSWORD,
        to_building: 12,
    };

    // The replica refuses locally...
    let err = attack
        .invoke(&mut h.peers[other].replica, &data)
        .unwrap_err();
    assert!(matches!(
        err,
        NetError::Authority(AuthorityError::NotOwner { .. })
    ));
    // ...and a forged frame is dropped by the server.
    let forged = ChannelCall::request(capital, attack.id(), data.to_wire());
    h.session
        .handle_frame(h.peers[other].id, raw(&forged.to_frame().unwrap()))
        .unwrap();
    h.tick();
    h.tick();
    let toggled = |h: &Harness, peer: usize| {
        *h.replica_object(peer, capital)
            .component::<Capital>()
            .unwrap()
            .client_toggled
            .get()
    };
    assert_eq!(toggled(&h, other), 0);

    attack.invoke(&mut h.peers[owner].replica, &data).unwrap();
    h.pump();
    // Handled this tick, replicated next tick.
    h.tick();
    h.tick();
    assert_eq!(toggled(&h, owner), 12);
    assert_eq!(toggled(&h, other), 12);
}

#[test]
fn dormant_objects_ignore_requests_until_woken() {
    let mut h = Harness::started();
    let p = h.connect();
    let id = h.peers[p].id;
    let unit = h.session.spawn_object("unit", Owner::Client(id)).unwrap();
    h.tick();
    h.session.set_dormant(unit, true).unwrap();

    let teleport = h.replica_object(p, unit).request::<Vec3>("teleport").unwrap();
    teleport
        .invoke(&mut h.peers[p].replica, &Vec3::new(1.0, 1.0, 1.0))
        .unwrap();
    h.pump();
    h.tick();
    let pos = |h: &Harness| {
        *h.server_object(unit)
            .component::<NetworkTransform>()
            .unwrap()
            .position
            .get()
    };
    assert_eq!(pos(&h), Vec3::ZERO);

    h.session.set_dormant(unit, false).unwrap();
    teleport
        .invoke(&mut h.peers[p].replica, &Vec3::new(1.0, 1.0, 1.0))
        .unwrap();
    h.pump();
    h.tick();
    assert_eq!(pos(&h), Vec3::new(1.0, 1.0, 1.0));
}

#[test]
fn instant_events_are_not_replayed() {
    let mut h = Harness::started();
    let early = h.connect();
    let capital = h.session.spawn_object("capital", Owner::Server).unwrap();
    h.tick();

    let ping = h.server_object(capital).event::<()>("ping").unwrap();
    ping.invoke(&mut h.session, &()).unwrap();
    h.pump();
    let late = h.connect();
    h.tick();

    let pings = |h: &Harness, peer: usize| {
        h.replica_object(peer, capital)
            .component::<Capital>()
            .unwrap()
            .pings
    };
    assert_eq!(pings(&h, early), 1);
    assert_eq!(pings(&h, late), 0);
    assert_eq!(
        h.server_object(capital).component::<Capital>().unwrap().pings,
        1
    );
}

#[test]
fn owner_events_follow_the_current_owner_on_replay() {
    let mut h = Harness::started();
    let owner = h.connect();
    let owner_id = h.peers[owner].id;
    let capital = h
        .session
        .spawn_object("capital", Owner::Client(owner_id))
        .unwrap();
    h.tick();
    let notice = h.server_object(capital).event::<u32>("owner_notice").unwrap();
    notice.invoke(&mut h.session, &1).unwrap();
    h.pump();

    let bystander = h.connect();
    h.tick();
    let notices = |h: &Harness, peer: usize| {
        h.replica_object(peer, capital)
            .component::<Capital>()
            .unwrap()
            .notices
    };
    assert_eq!(notices(&h, owner), 1);
    assert_eq!(notices(&h, bystander), 0);
}

#[test]
fn spawned_components_reach_current_and_late_clients() {
    let mut h = Harness::started();
    let early = h.connect();
    let unit = h.session.spawn_object("unit", Owner::Server).unwrap();
    h.tick();

    let mut extra = Capital::default();
    extra.name.set("Outpost".into());
    let cid = h.session.spawn_component(unit, extra).unwrap();
    assert_eq!(cid.local, 1);
    h.pump();

    let late = h.connect();
    h.tick();
    for peer in [early, late] {
        let obj = h.replica_object(peer, unit);
        assert_eq!(obj.components().len(), 2);
        assert_eq!(obj.component::<Capital>().unwrap().name.get(), "Outpost");
    }
    assert_same_state(h.server_object(unit), h.replica_object(late, unit));
}

#[test]
fn replicas_publish_received_updates() {
    let mut h = Harness::started();
    let p = h.connect();
    let unit = h.session.spawn_object("unit", Owner::Server).unwrap();
    h.tick();
    h.peers[p].replica.drain_events();

    h.session
        .object_mut(unit)
        .unwrap()
        .component_mut::<NetworkTransform>()
        .unwrap()
        .position
        .set(Vec3::ONE);
    h.tick();
    assert_eq!(
        h.peers[p].replica.drain_events(),
        vec![ClientEvent::ObjectUpdated {
            component: ComponentId::new(unit, 0),
            mask: 0b001,
        }]
    );
    assert_eq!(
        *h.replica_object(p, unit)
            .component::<NetworkTransform>()
            .unwrap()
            .position
            .get(),
        Vec3::ONE
    );

    h.tick();
    assert!(h.peers[p].replica.drain_events().is_empty());
}

#[test]
fn destroy_policy_clears_replicas_of_a_leaving_owner() {
    let mut h = Harness::new(NetConfig {
        disconnect_policy: DisconnectPolicy::Destroy,
        ..NetConfig::default()
    });
    h.session.start_game().unwrap();
    let leaving = h.connect();
    let staying = h.connect();
    let leaving_id = h.peers[leaving].id;
    let owned = h
        .session
        .spawn_object("unit", Owner::Client(leaving_id))
        .unwrap();
    let shared = h.session.spawn_object("unit", Owner::Server).unwrap();
    h.tick();
    h.peers[staying].replica.drain_events();

    h.session.disconnect_client(leaving_id, "quit");
    h.pump();
    assert!(h.peers[staying].replica.object(owned).is_none());
    assert!(h.peers[staying].replica.object(shared).is_some());
    assert_eq!(
        h.peers[staying].replica.drain_events(),
        vec![ClientEvent::ObjectDestroyed(owned)]
    );
}

#[test]
fn kicked_clients_see_the_disconnect() {
    let mut h = Harness::started();
    let p = h.connect();
    let id = h.peers[p].id;
    h.session.kick(id, "maintenance").unwrap();
    h.pump();
    assert_eq!(h.peers[p].replica.state(), ConnectionState::Disconnected);
    assert!(h.session.client_phase(id).is_none());
}
