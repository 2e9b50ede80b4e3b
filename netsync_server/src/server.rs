//! Server implementation.
//!
//! Tokio shell around `ServerSession`. One `step()` is one tick:
//! - accept pending sockets
//! - feed inbound frames to the session in arrival order
//! - run console commands
//! - run the session tick
//! - tear down connections the session dropped
//!
//! All replication state lives on the tick task; I/O tasks only move bytes.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use netsync_shared::{
    config::NetConfig,
    demo::demo_registry,
    event::SessionEvent,
    net::{Connection, Inbound, LinkEvent, ReliableListener, INBOUND_QUEUE_FRAMES},
    object::{ClientId, ObjectId, Owner},
    registry::Registry,
};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::session::{DropMode, ServerSession};

/// Game server.
pub struct GameServer {
    pub cfg: NetConfig,
    session: ServerSession,
    local_addr: SocketAddr,

    accept_task: JoinHandle<()>,
    accepted: mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>,
    inbound_tx: mpsc::Sender<Inbound<ClientId>>,
    inbound_rx: mpsc::Receiver<Inbound<ClientId>>,
    conns: HashMap<ClientId, Connection>,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
    shutdown: bool,
}

impl GameServer {
    /// Binds the listener from `cfg.server_addr` and starts accepting.
    pub async fn bind(cfg: NetConfig, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (accept_tx, accepted) = mpsc::unbounded_channel();
        let accept_task = listener.spawn_accept_loop(accept_tx);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_FRAMES);

        Ok(Self {
            session: ServerSession::new(registry, &cfg),
            cfg,
            local_addr,
            accept_task,
            accepted,
            inbound_tx,
            inbound_rx,
            conns: HashMap::new(),
            console_rx: None,
            shutdown: false,
        })
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &ServerSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession {
        &mut self.session
    }

    /// True once `quit` has been run.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = tick_interval(self.cfg.tick_hz);
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Runs ticks at the configured rate until `quit`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let dt = tick_interval(self.cfg.tick_hz);
        let mut next = Instant::now();
        while !self.shutdown {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        info!("Server shutting down");
        Ok(())
    }

    /// Executes one tick.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.accept_pending();
        self.recv_frames();
        self.process_console_commands();
        self.session.tick();
        self.reap_dropped();
        self.log_session_events();
        Ok(())
    }

    fn accept_pending(&mut self) {
        while let Ok((stream, peer)) = self.accepted.try_recv() {
            let (out_tx, out_rx) = mpsc::channel::<Bytes>(self.cfg.outbound_queue_frames.max(1));
            let client = self.session.connect_client(out_tx);
            match Connection::spawn(stream, client, self.inbound_tx.clone(), out_rx) {
                Ok(conn) => {
                    debug!(client_id = ?client, %peer, "connection tasks started");
                    self.conns.insert(client, conn);
                }
                Err(e) => {
                    warn!(client_id = ?client, %peer, error = %e, "failed to start connection");
                    self.session.disconnect_client(client, "connection setup failed");
                }
            }
        }
    }

    fn recv_frames(&mut self) {
        while let Ok((client, event)) = self.inbound_rx.try_recv() {
            match event {
                LinkEvent::Frame(frame) => {
                    let kind = frame.kind;
                    if let Err(e) = self.session.handle_frame(client, frame) {
                        warn!(client_id = ?client, kind, error = %e, "bad frame from client");
                    }
                }
                LinkEvent::Closed { reason } => {
                    self.session.disconnect_client(client, &reason);
                }
            }
        }
    }

    fn process_console_commands(&mut self) {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            match self.exec_console(&line) {
                Ok(out) => {
                    for l in out {
                        println!("{l}");
                    }
                }
                Err(e) => println!("{e:#}"),
            }
        }
    }

    fn reap_dropped(&mut self) {
        for (client, mode) in self.session.take_dropped() {
            let Some(conn) = self.conns.remove(&client) else {
                continue;
            };
            match mode {
                DropMode::Hard => conn.abort(),
                DropMode::Flush => conn.close(),
            }
            debug!(client_id = ?client, peer = %conn.peer_addr(), ?mode, "connection released");
        }
    }

    fn log_session_events(&mut self) {
        for ev in self.session.drain_events() {
            match ev {
                SessionEvent::ClientConnected(id) => debug!(client_id = ?id, "session: connected"),
                SessionEvent::ClientJoinedGame(id) => info!(client_id = ?id, "Client joined game"),
                SessionEvent::ClientDisconnected { client, reason } => {
                    debug!(client_id = ?client, %reason, "session: disconnected")
                }
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let s = &self.session;
                let mut out = vec![
                    format!("In progress: {}", s.is_in_progress()),
                    format!("Tick: {}", s.tick_count()),
                ];
                let clients: Vec<ClientId> = s.client_ids().collect();
                out.push(format!("Clients: {}", clients.len()));
                for id in clients {
                    let peer = self
                        .conns
                        .get(&id)
                        .map(|c| c.peer_addr().to_string())
                        .unwrap_or_else(|| "-".to_string());
                    out.push(format!("  {:?}: {:?} peer={}", id, s.client_phase(id), peer));
                }
                out.push(format!("Objects: {}", s.objects().count()));
                for obj in s.objects() {
                    out.push(format!(
                        "  {}: owner={:?} dormant={}",
                        obj.id(),
                        obj.owner(),
                        obj.is_dormant()
                    ));
                }
                Ok(out)
            }
            "start" => {
                self.session.start_game()?;
                Ok(vec!["Game started".to_string()])
            }
            "spawn" => {
                let Some(template) = tokens.get(1) else {
                    return Ok(vec!["Usage: spawn <template> [owner client id]".to_string()]);
                };
                let owner = match tokens.get(2) {
                    Some(raw) => Owner::Client(ClientId(raw.parse().context("parse client id")?)),
                    None => Owner::Server,
                };
                let id = self.session.spawn_object(template, owner)?;
                Ok(vec![format!("Spawned {id}")])
            }
            "destroy" => {
                let id = parse_object(tokens.get(1))?;
                self.session.destroy_object(id)?;
                Ok(vec![format!("Destroyed {id}")])
            }
            "dormant" => {
                let id = parse_object(tokens.get(1))?;
                let dormant = match tokens.get(2) {
                    Some(&"on") => true,
                    Some(&"off") => false,
                    _ => return Ok(vec!["Usage: dormant <object> on|off".to_string()]),
                };
                self.session.set_dormant(id, dormant)?;
                Ok(vec![format!("{id} dormant={dormant}")])
            }
            "kick" => {
                let Some(raw) = tokens.get(1) else {
                    return Ok(vec!["Usage: kick <client id>".to_string()]);
                };
                let client = ClientId(raw.parse().context("parse client id")?);
                self.session.kick(client, "kicked by server")?;
                Ok(vec![format!("Kicked {client:?}")])
            }
            "quit" | "exit" => {
                self.shutdown = true;
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        for conn in self.conns.values() {
            conn.abort();
        }
    }
}

fn parse_object(raw: Option<&&str>) -> anyhow::Result<ObjectId> {
    let raw = raw.context("missing object id")?;
    let n = raw.trim_start_matches('#').parse().context("parse object id")?;
    Ok(ObjectId(n))
}

fn tick_interval(tick_hz: u32) -> Duration {
    Duration::from_secs_f32(1.0 / tick_hz.max(1) as f32)
}

/// Helper for tests: bind to an ephemeral port with the demo registry.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, NetConfig)> {
    let cfg = NetConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let registry = Arc::new(demo_registry()?);
    let server = GameServer::bind(cfg, registry).await?;

    let mut cfg = server.cfg.clone();
    cfg.server_addr = server.local_addr().to_string();
    Ok((server, cfg))
}
