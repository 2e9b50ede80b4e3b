//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netsync_client -- [--addr 127.0.0.1:40000] [--name Player] [--config client.json]
//!
//! The client connects, waits in the lobby until the server starts the game,
//! then mirrors every replicated object.
//!
//! Console commands:
//!   status                           - Show connection state and objects
//!   attack <object> <building> [pw]  - Send the capital's attack request
//!   teleport <object> <x> <y> <z>    - Send the transform's teleport request
//!   quit                             - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use netsync_client::client::GameClient;
use netsync_shared::{
    config::NetConfig,
    demo::demo_registry,
    event::{ClientEvent, ConnectionState},
};
use tokio::sync::mpsc;
use tracing::{debug, info};

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1])
                .with_context(|| format!("read config {}", args[i + 1]))?;
            NetConfig::from_json_str(&text).context("parse config")?
        }
        _ => NetConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let registry = Arc::new(demo_registry().context("build registry")?);
    let mut client = GameClient::connect(&cfg, registry)
        .await
        .context("connect")?;
    client
        .wait_for_state(ConnectionState::JoinedLobby, Duration::from_secs(5))
        .await
        .context("handshake")?;
    info!(client_id = ?client.replica().client_id(), "In lobby");

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);

    loop {
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line) {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        client.poll();
        for ev in client.replica_mut().drain_events() {
            match ev {
                ClientEvent::StateChanged(state) => info!(?state, "Connection state"),
                ClientEvent::ObjectSpawned { object, template } => {
                    info!(%object, %template, "Object spawned")
                }
                ClientEvent::ObjectUpdated { component, mask } => {
                    debug!(?component, mask, "Object updated")
                }
                ClientEvent::ObjectDestroyed(object) => info!(%object, "Object destroyed"),
            }
        }

        if matches!(
            client.state(),
            ConnectionState::Disconnected | ConnectionState::ConnectionFailed
        ) {
            println!("Disconnected from server.");
            break;
        }

        tokio::time::sleep(tick_interval).await;
    }

    Ok(())
}
