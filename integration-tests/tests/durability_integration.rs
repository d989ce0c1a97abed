//! State survives restarts and is shared between invocations.

mod common;

use anyhow::Result;
use common::{branch, eventually, free_port, project, Client, IntegrationTestContext};
use dbranch_kernel::domain::{BranchName, BranchState};
use dbranch_kernel::host::run_daemon;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::test]
async fn test_reopened_store_sees_committed_state() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let p1 = project("p1");
    {
        let manager = ctx.manager();
        manager.init(&p1, Some(free_port())).await?;
        manager.create(&p1, &branch("b1"), None).await?;
        manager.use_branch(&p1, &branch("b1")).await?;
    }

    let reopened = ctx.second_manager().await?;
    let status = reopened.status(&p1).await?;
    assert_eq!(status.active_branch, branch("b1"));
    let names: Vec<_> = status.branches.iter().map(|b| b.name.to_string()).collect();
    assert_eq!(names, vec!["main", "b1"]);
    assert_eq!(status.branches[1].state, BranchState::Running);
    assert_eq!(reopened.default_project().await?, Some(p1));
    Ok(())
}

#[tokio::test]
async fn test_daemon_follows_switches_made_elsewhere() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let p1 = project("p1");
    let proxy_port = free_port();

    let cli = ctx.second_manager().await?;
    cli.init(&p1, Some(proxy_port)).await?;
    cli.create(&p1, &branch("b1"), None).await?;
    cli.use_branch(&p1, &BranchName::main()).await?;

    let mut settings = ctx.settings.clone();
    settings.server.enabled = false;
    let host = Arc::new(dbranch_kernel::host::HostState::new(
        Arc::clone(ctx.manager()),
        settings,
    ));
    let (stop, stopped) = watch::channel(false);
    let daemon = tokio::spawn(run_daemon(host, stopped));

    let pause = Duration::from_millis(50);
    let reply = eventually(40, pause, || async {
        Client::connect(proxy_port).await?.ask("q").await
    })
    .await?;
    assert_eq!(reply, "p1_main q");

    cli.use_branch(&p1, &branch("b1")).await?;
    let reply = eventually(40, pause, || async {
        let reply = Client::connect(proxy_port).await?.ask("q").await?;
        anyhow::ensure!(reply == "p1_b1 q", "still routed to: {reply}");
        Ok(reply)
    })
    .await?;
    assert_eq!(reply, "p1_b1 q");

    stop.send(true)?;
    daemon.await??;
    assert!(Client::connect(proxy_port).await.is_err());
    Ok(())
}
