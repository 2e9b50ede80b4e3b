use netsync_server::server::bind_ephemeral;
use netsync_shared::{config::NetConfig, object::Owner};

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.session().tick_count(), 3);
    Ok(())
}

/// Objects spawned with nobody connected wait quietly for the first joiner.
#[tokio::test]
async fn empty_game_ticks_with_objects() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.exec_console("start")?;
    server.session_mut().spawn_object("capital", Owner::Server)?;
    server.exec_console("spawn unit")?;
    server.run_for_ticks(2).await?;
    assert_eq!(server.session().objects().count(), 2);

    let reparsed = NetConfig::from_json_str(&serde_json::to_string(&cfg)?)?;
    assert_eq!(reparsed.server_addr, cfg.server_addr);
    Ok(())
}
