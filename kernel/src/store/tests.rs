use super::*;
use crate::domain::{Branch, BranchName, BranchState, Project, ProjectName};
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;

fn project(name: &str, proxy_port: u16) -> Project {
    Project {
        name: ProjectName::new(name).unwrap(),
        device: PathBuf::from(format!("/dev/{name}")),
        mount_point: PathBuf::from(format!("/mnt/{name}")),
        proxy_port,
        active_branch: BranchName::main(),
        created_at: Utc::now(),
    }
}

fn branch(project: &str, name: &str, parent: Option<&str>, port: u16) -> Branch {
    Branch {
        project: ProjectName::new(project).unwrap(),
        name: BranchName::new(name).unwrap(),
        parent: parent.map(|p| BranchName::new(p).unwrap()),
        snapshot_path: PathBuf::from(format!("/mnt/{project}/{name}")),
        port,
        state: BranchState::Stopped,
        process_ref: None,
        created_at: Utc::now(),
    }
}

async fn setup() -> Result<BranchStore> {
    let store = BranchStore::in_memory().await?;
    store
        .create_project(&project("p1", 5432), &branch("p1", "main", None, 7000))
        .await?;
    Ok(store)
}

fn p1() -> ProjectName {
    ProjectName::new("p1").unwrap()
}

fn name(n: &str) -> BranchName {
    BranchName::new(n).unwrap()
}

#[tokio::test]
async fn test_create_project_sets_root_active() -> Result<()> {
    let store = setup().await?;
    let active = store.get_active(&p1()).await?;
    assert_eq!(active.name, BranchName::main());
    assert_eq!(active.port, 7000);
    assert_eq!(store.list_projects().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_project_rejected() -> Result<()> {
    let store = setup().await?;
    let err = store
        .create_project(&project("p1", 6000), &branch("p1", "main", None, 7001))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ProjectExists(_)));
    Ok(())
}

#[tokio::test]
async fn test_record_branch_checks_name_port_and_parent() -> Result<()> {
    let store = setup().await?;
    store
        .record_branch(&branch("p1", "b1", Some("main"), 7001))
        .await?;

    let dup = store
        .record_branch(&branch("p1", "b1", Some("main"), 7002))
        .await
        .unwrap_err();
    assert!(matches!(dup, StoreError::BranchExists { .. }));

    let port = store
        .record_branch(&branch("p1", "b2", Some("main"), 7001))
        .await
        .unwrap_err();
    assert!(matches!(port, StoreError::PortInUse(7001)));

    let orphan = store
        .record_branch(&branch("p1", "b3", Some("ghost"), 7003))
        .await
        .unwrap_err();
    assert!(matches!(orphan, StoreError::BranchNotFound { .. }));

    let ports = store.allocated_ports().await?;
    assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![5432, 7000, 7001]);
    Ok(())
}

#[tokio::test]
async fn test_status_updates_follow_lifecycle() -> Result<()> {
    let store = setup().await?;
    let prev = store
        .update_branch_status(&p1(), &name("main"), BranchState::Starting)
        .await?;
    assert_eq!(prev, BranchState::Stopped);

    let err = store
        .update_branch_status(&p1(), &name("main"), BranchState::Deleted)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Transition(_)));
    assert_eq!(
        store.get_branch(&p1(), &name("main")).await?.state,
        BranchState::Starting
    );
    Ok(())
}

#[tokio::test]
async fn test_remove_branch_refuses_active_and_pending_children() -> Result<()> {
    let store = setup().await?;
    let mut pending = branch("p1", "b1", Some("main"), 7001);
    pending.state = BranchState::Creating;
    store.record_branch(&pending).await?;

    let active = store.remove_branch(&p1(), &name("main")).await.unwrap_err();
    assert!(matches!(active, StoreError::ActiveBranch { .. }));

    store.set_active(&p1(), &name("b1")).await?;
    let parent = store.remove_branch(&p1(), &name("main")).await.unwrap_err();
    match parent {
        StoreError::HasChildren { children, .. } => assert_eq!(children, vec!["b1"]),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_remove_branch_reparents_children() -> Result<()> {
    let store = setup().await?;
    store
        .record_branch(&branch("p1", "b1", Some("main"), 7001))
        .await?;
    store
        .record_branch(&branch("p1", "b2", Some("b1"), 7002))
        .await?;

    store.remove_branch(&p1(), &name("b1")).await?;
    assert_eq!(store.get_branch(&p1(), &name("b2")).await?.parent, Some(name("main")));

    store.set_active(&p1(), &name("b2")).await?;
    store.remove_branch(&p1(), &name("main")).await?;
    assert_eq!(store.get_branch(&p1(), &name("b2")).await?.parent, None);
    Ok(())
}

#[tokio::test]
async fn test_set_active_requires_existing_branch() -> Result<()> {
    let store = setup().await?;
    let err = store.set_active(&p1(), &name("nope")).await.unwrap_err();
    assert!(matches!(err, StoreError::BranchNotFound { .. }));
    assert_eq!(store.get_active(&p1()).await?.name, BranchName::main());
    Ok(())
}

#[tokio::test]
async fn test_delete_project_cascades_and_frees_ports() -> Result<()> {
    let store = setup().await?;
    store
        .record_branch(&branch("p1", "b1", Some("main"), 7001))
        .await?;
    store.set_default_project(Some(&p1())).await?;

    store.delete_project(&p1()).await?;

    assert!(store.allocated_ports().await?.is_empty());
    assert!(store.default_project().await?.is_none());
    assert!(matches!(
        store.list_branches(&p1()).await.unwrap_err(),
        StoreError::ProjectNotFound(_)
    ));

    store
        .create_project(&project("p2", 5432), &branch("p2", "main", None, 7000))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_process_ref_roundtrip() -> Result<()> {
    let store = setup().await?;
    store
        .set_process_ref(&p1(), &name("main"), Some("container-1"))
        .await?;
    assert_eq!(
        store.get_branch(&p1(), &name("main")).await?.process_ref.as_deref(),
        Some("container-1")
    );
    store.set_process_ref(&p1(), &name("main"), None).await?;
    assert!(store.get_branch(&p1(), &name("main")).await?.process_ref.is_none());
    Ok(())
}

#[tokio::test]
async fn test_state_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("state.db").display());

    {
        let store = BranchStore::connect(&url).await?;
        store
            .create_project(&project("p1", 5432), &branch("p1", "main", None, 7000))
            .await?;
        store
            .record_branch(&branch("p1", "b1", Some("main"), 7001))
            .await?;
        store.set_active(&p1(), &name("b1")).await?;
        store.close().await;
    }

    let store = BranchStore::connect(&url).await?;
    assert_eq!(store.get_active(&p1()).await?.name, name("b1"));
    assert_eq!(store.list_branches(&p1()).await?.len(), 2);
    Ok(())
}
