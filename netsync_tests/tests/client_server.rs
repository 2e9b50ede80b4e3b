//! Full socket-based integration tests for client ↔ server communication.

use std::{future::Future, sync::Arc, time::Duration};

use netsync_client::GameClient;
use netsync_server::server::{bind_ephemeral, GameServer};
use netsync_shared::{
    config::NetConfig,
    demo::{demo_registry, AttackData, Capital, CORRECT_PASSWORD},
    event::ConnectionState,
    object::{ClientId, Owner},
};
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Steps the server and polls the client on one task until `done` holds.
async fn pump_until(
    server: &mut GameServer,
    client: &mut GameClient,
    mut done: impl FnMut(&GameServer, &GameClient) -> bool,
) -> anyhow::Result<()> {
    for _ in 0..400 {
        server.step().await?;
        client.poll();
        if done(server, client) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("condition not reached; client state {:?}", client.state())
}

/// Runs the server on its own task until told to stop, then hands it back.
fn spawn_server(
    mut server: GameServer,
) -> (
    oneshot::Sender<()>,
    impl Future<Output = anyhow::Result<GameServer>>,
) {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        while stop_rx.try_recv().is_err() {
            server.step().await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>(server)
    });
    (stop_tx, async move { handle.await? })
}

/// Full integration: server on its own task, client joins and replicates.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_joins_and_mirrors_objects() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.session_mut().start_game()?;
    let capital = server.session_mut().spawn_object("capital", Owner::Server)?;
    let (stop, finished) = spawn_server(server);

    let registry = Arc::new(demo_registry()?);
    let mut client = GameClient::connect(&cfg, registry).await?;
    client
        .wait_for_state(ConnectionState::JoinedGame, Duration::from_secs(5))
        .await?;

    let obj = client.replica().object(capital).expect("capital replicated");
    assert_eq!(obj.owner(), Owner::Server);
    assert_eq!(
        obj.component::<Capital>().unwrap().name.get(),
        "Hello World"
    );

    let _ = stop.send(());
    let server = finished.await?;
    assert_eq!(server.session().client_ids().count(), 1);
    Ok(())
}

#[tokio::test]
async fn owner_request_changes_replicated_state() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.session_mut().start_game()?;
    // The first client to connect gets id 1.
    let capital = server
        .session_mut()
        .spawn_object("capital", Owner::Client(ClientId(1)))?;

    let mut client = GameClient::connect(&cfg, Arc::new(demo_registry()?)).await?;
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == ConnectionState::JoinedGame
    })
    .await?;

    let out = client.exec_console(&format!("attack {capital} 7"))?;
    assert_eq!(out, vec![format!("Sent attack to {capital}")]);

    let toggled = |c: &GameClient| {
        c.replica()
            .object(capital)
            .and_then(|o| o.component::<Capital>())
            .map(|cap| *cap.client_toggled.get())
    };
    pump_until(&mut server, &mut client, |_, c| toggled(c) == Some(7)).await?;

    // A wrong password reaches the handler but changes nothing.
    let request = client
        .replica()
        .object(capital)
        .and_then(|o| o.request::<AttackData>("attack"))
        .expect("attack request");
    request.invoke(
        client.replica_mut(),
        &AttackData {
            password: CORRECT_PASSWORD + 1,
            to_building: 99,
        },
    )?;
    for _ in 0..5 {
        server.step().await?;
        client.poll();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(toggled(&client), Some(7));
    Ok(())
}

#[tokio::test]
async fn kick_reaches_the_client() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;
    let mut client = GameClient::connect(&cfg, Arc::new(demo_registry()?)).await?;
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == ConnectionState::JoinedLobby
    })
    .await?;

    server.exec_console("kick 1")?;
    pump_until(&mut server, &mut client, |s, c| {
        c.state() == ConnectionState::Disconnected && s.connection_count() == 0
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn client_disconnect_orphans_its_objects() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.session_mut().start_game()?;
    let unit = server
        .session_mut()
        .spawn_object("unit", Owner::Client(ClientId(1)))?;

    let mut client = GameClient::connect(&cfg, Arc::new(demo_registry()?)).await?;
    pump_until(&mut server, &mut client, |_, c| {
        c.state() == ConnectionState::JoinedGame
    })
    .await?;

    client.disconnect("done");
    pump_until(&mut server, &mut client, |s, _| {
        s.session().client_ids().count() == 0
    })
    .await?;
    assert_eq!(
        server.session().object(unit).map(|o| o.owner()),
        Some(Owner::Server)
    );
    Ok(())
}

#[tokio::test]
async fn connecting_to_a_closed_port_fails() -> anyhow::Result<()> {
    let (server, cfg) = bind_ephemeral(64).await?;
    drop(server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let cfg = NetConfig {
        server_addr: cfg.server_addr,
        ..NetConfig::default()
    };
    assert!(GameClient::connect(&cfg, Arc::new(demo_registry()?))
        .await
        .is_err());
    Ok(())
}
