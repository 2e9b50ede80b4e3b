//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p netsync_server -- [--addr 127.0.0.1:40000] [--tick-hz 30] [--config server.json]
//!
//! Console commands:
//!   start                      - Start the game; lobby clients begin loading
//!   spawn <template> [client]  - Spawn an object, optionally client-owned
//!   destroy <object>           - Destroy an object
//!   dormant <object> on|off    - Toggle request handling for an object
//!   kick <client>              - Disconnect a client
//!   status                     - Show clients and objects
//!   quit                       - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use netsync_server::server::GameServer;
use netsync_shared::{config::NetConfig, demo::demo_registry};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<NetConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
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
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(30);
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
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, policy = ?cfg.disconnect_policy, "Starting server");

    let registry = Arc::new(demo_registry().context("build registry")?);
    let mut server = GameServer::bind(cfg, registry)
        .await
        .context("create server")?;
    info!(local = %server.local_addr(), "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

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

    println!("Server ready. Type 'start' to begin, 'status' for info, 'quit' to exit.");
    println!();

    server.run().await
}
