//! Client implementation.
//!
//! The client maintains:
//! - One TCP connection (reader and writer tasks from `net`)
//! - A `ClientReplica` fed from the reader's queue on the caller's task
//! - Console commands for poking at replicated objects

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use netsync_shared::{
    config::NetConfig,
    demo::AttackData,
    event::ConnectionState,
    math::Vec3,
    net::{self, Connection, Inbound, LinkEvent, INBOUND_QUEUE_FRAMES},
    object::ObjectId,
    registry::Registry,
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{info, warn};

use crate::replica::ClientReplica;

/// High-level game client.
pub struct GameClient {
    replica: ClientReplica,
    conn: Connection,
    inbound: mpsc::Receiver<Inbound<()>>,
}

impl GameClient {
    /// Connects to a server and sends the handshake.
    ///
    /// Returns once the handshake is queued; the `Welcome` arrives through
    /// `poll` like every other frame.
    pub async fn connect(cfg: &NetConfig, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "Connecting to server");

        let stream = net::connect(server_addr).await?;
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(cfg.outbound_queue_frames.max(1));
        let (in_tx, inbound) = mpsc::channel(INBOUND_QUEUE_FRAMES);
        let conn = Connection::spawn(stream, (), in_tx, out_rx)?;

        let mut replica = ClientReplica::new(registry, out_tx);
        replica.send_handshake().context("send handshake")?;

        Ok(Self {
            replica,
            conn,
            inbound,
        })
    }

    pub fn replica(&self) -> &ClientReplica {
        &self.replica
    }

    pub fn replica_mut(&mut self) -> &mut ClientReplica {
        &mut self.replica
    }

    pub fn state(&self) -> ConnectionState {
        self.replica.state()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    fn apply(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => {
                let kind = frame.kind;
                if let Err(e) = self.replica.handle_frame(frame) {
                    warn!(kind, error = %e, "bad frame from server");
                }
            }
            LinkEvent::Closed { reason } => self.replica.connection_lost(&reason),
        }
    }

    /// Applies every frame received so far without waiting.
    pub fn poll(&mut self) -> usize {
        let mut n = 0;
        while let Ok(((), event)) = self.inbound.try_recv() {
            self.apply(event);
            n += 1;
        }
        n
    }

    /// Applies frames until the replica reaches `state`.
    ///
    /// Only useful when the server runs on another task or process.
    pub async fn wait_for_state(
        &mut self,
        state: ConnectionState,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll();
            let now = self.replica.state();
            if now == state {
                return Ok(());
            }
            if matches!(
                now,
                ConnectionState::Disconnected | ConnectionState::ConnectionFailed
            ) {
                anyhow::bail!("connection ended in {now:?} while waiting for {state:?}");
            }
            match tokio::time::timeout_at(deadline, self.inbound.recv()).await {
                Ok(Some(((), event))) => self.apply(event),
                Ok(None) => self.replica.connection_lost("inbound queue closed"),
                Err(_) => anyhow::bail!("timed out waiting for {state:?}, still {now:?}"),
            }
        }
    }

    /// Tells the server we are leaving and stops reading.
    pub fn disconnect(&mut self, reason: &str) {
        if let Err(e) = self.replica.send_disconnect(reason) {
            warn!(error = %e, "could not queue disconnect");
        }
        self.conn.close();
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = vec![
                    format!("State: {:?}", self.replica.state()),
                    format!("Client id: {:?}", self.replica.client_id()),
                    format!("Objects: {}", self.replica.objects().count()),
                ];
                for obj in self.replica.objects() {
                    out.push(format!(
                        "  {}: owner={:?} components={}",
                        obj.id(),
                        obj.owner(),
                        obj.components().len()
                    ));
                }
                Ok(out)
            }
            "attack" => {
                let (Some(obj), Some(building)) = (tokens.get(1), tokens.get(2)) else {
                    return Ok(vec!["Usage: attack <object> <building> [password]".to_string()]);
                };
                let id = parse_object(obj)?;
                let data = AttackData {
                    to_building: building.parse().context("parse building")?,
                    password: match tokens.get(3) {
                        Some(p) => p.parse().context("parse password")?,
                        None => netsync_shared::demo::CORRECT_PASSWORD,
                    },
                };
                let request = self
                    .replica
                    .object(id)
                    .and_then(|o| o.request::<AttackData>("attack"))
                    .with_context(|| format!("{id} has no attack request"))?;
                request.invoke(&mut self.replica, &data)?;
                Ok(vec![format!("Sent attack to {id}")])
            }
            "teleport" => {
                if tokens.len() < 5 {
                    return Ok(vec!["Usage: teleport <object> <x> <y> <z>".to_string()]);
                }
                let id = parse_object(tokens[1])?;
                let mut xyz = [0.0f32; 3];
                for (slot, raw) in xyz.iter_mut().zip(&tokens[2..5]) {
                    *slot = raw.parse().context("parse coordinate")?;
                }
                let request = self
                    .replica
                    .object(id)
                    .and_then(|o| o.request::<Vec3>("teleport"))
                    .with_context(|| format!("{id} has no teleport request"))?;
                request.invoke(&mut self.replica, &Vec3::new(xyz[0], xyz[1], xyz[2]))?;
                Ok(vec![format!("Sent teleport to {id}")])
            }
            "disconnect" | "quit" | "exit" => {
                self.disconnect("client quit");
                Ok(vec!["Disconnected".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

fn parse_object(raw: &str) -> anyhow::Result<ObjectId> {
    let n = raw.trim_start_matches('#').parse().context("parse object id")?;
    Ok(ObjectId(n))
}
