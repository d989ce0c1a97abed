//! End-to-end branch lifecycle through the proxy.
//!
//! init → create → use, with connections opened before the switch staying on
//! the old branch while new ones reach the new active branch.

mod common;

use anyhow::Result;
use common::{branch, free_port, project, Client, IntegrationTestContext};
use dbranch_kernel::domain::{BranchName, BranchState};
use dbranch_kernel::host::ProxyFleet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

#[tokio::test]
async fn test_switch_keeps_open_connections() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    let proxy_port = free_port();

    let created = manager.init(&p1, Some(proxy_port)).await?;
    assert_eq!(created.active_branch, BranchName::main());
    let main = manager.list_branches(&p1).await?.remove(0);
    assert_eq!(main.port, ctx.min_port());

    let b1 = manager.create(&p1, &branch("b1"), None).await?;
    assert_eq!(b1.port, ctx.min_port() + 1);
    assert_eq!(manager.status(&p1).await?.active_branch, BranchName::main());

    let mut fleet = ProxyFleet::new(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        manager.routes().clone(),
        Duration::from_millis(500),
    );
    fleet.sync(&manager.store().list_projects().await?).await;

    manager.use_branch(&p1, &BranchName::main()).await?;
    let mut old = Client::connect(proxy_port).await?;
    assert_eq!(old.ask("before").await?, "p1_main before");

    manager.use_branch(&p1, &branch("b1")).await?;
    let mut new = Client::connect(proxy_port).await?;
    assert_eq!(new.ask("after").await?, "p1_b1 after");
    assert_eq!(old.ask("still").await?, "p1_main still");

    fleet.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_delete_inactive_main_releases_port() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    manager.create(&p1, &branch("b1"), None).await?;
    manager.use_branch(&p1, &branch("b1")).await?;

    let main = manager.show(&p1, &BranchName::main()).await?;
    manager.delete_branch(&p1, &BranchName::main()).await?;

    assert!(!main.snapshot_path.exists());
    let ports = manager.store().allocated_ports().await?;
    assert!(!ports.contains(&main.port));

    // The released port is handed out again.
    let b2 = manager.create(&p1, &branch("b2"), None).await?;
    assert_eq!(b2.port, main.port);
    Ok(())
}

#[tokio::test]
async fn test_delete_of_active_branch_changes_nothing() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    manager.use_branch(&p1, &BranchName::main()).await?;

    let before = manager.status(&p1).await?;
    let err = manager
        .delete_branch(&p1, &BranchName::main())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), dbranch_kernel::branch_manager::ErrorKind::State);

    let after = manager.status(&p1).await?;
    assert_eq!(after.branches.len(), before.branches.len());
    assert_eq!(after.branches[0].state, BranchState::Running);
    assert!(after.branches[0].snapshot_path.exists());
    assert!(manager.routes().resolve(&p1).is_some());
    Ok(())
}

#[tokio::test]
async fn test_project_delete_frees_ports_for_reuse() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    let proxy_port = free_port();
    manager.init(&p1, Some(proxy_port)).await?;
    manager.create(&p1, &branch("b1"), None).await?;
    manager.create(&p1, &branch("b2"), Some(&branch("b1"))).await?;
    manager.use_branch(&p1, &branch("b2")).await?;
    let mount_point = manager.status(&p1).await?.mount_point;

    manager.delete_project(&p1).await?;
    assert!(!mount_point.exists());
    assert!(manager.store().allocated_ports().await?.is_empty());
    assert_eq!(ctx.runtime.running(), 0);

    let p2 = project("p2");
    manager.init(&p2, Some(proxy_port)).await?;
    let ports: Vec<u16> = manager
        .list_branches(&p2)
        .await?
        .iter()
        .map(|b| b.port)
        .collect();
    assert_eq!(ports, vec![ctx.min_port()]);
    Ok(())
}
