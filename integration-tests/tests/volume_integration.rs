//! Copy-on-write isolation between branches.

mod common;

use anyhow::Result;
use common::{branch, free_port, project, IntegrationTestContext};
use std::fs;

#[tokio::test]
async fn test_snapshot_isolation() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    let main = manager.list_branches(&p1).await?.remove(0);

    fs::write(main.data_dir().join("table.dat"), b"v1")?;
    let b1 = manager.create(&p1, &branch("b1"), None).await?;
    fs::write(main.data_dir().join("table.dat"), b"v2")?;
    fs::write(main.data_dir().join("later.dat"), b"x")?;

    assert_eq!(fs::read(b1.data_dir().join("table.dat"))?, b"v1");
    assert!(!b1.data_dir().join("later.dat").exists());

    // Writes on the child do not leak back either.
    fs::write(b1.data_dir().join("child.dat"), b"c")?;
    assert!(!main.data_dir().join("child.dat").exists());
    Ok(())
}

#[tokio::test]
async fn test_snapshot_of_non_active_source() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    let b1 = manager.create(&p1, &branch("b1"), None).await?;
    fs::write(b1.data_dir().join("only-in-b1"), b"1")?;

    let b2 = manager
        .create(&p1, &branch("b2"), Some(&branch("b1")))
        .await?;
    assert_eq!(b2.parent, Some(branch("b1")));
    assert!(b2.data_dir().join("only-in-b1").exists());
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_data_dir_permissions_survive_snapshot() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    let b1 = manager.create(&p1, &branch("b1"), None).await?;

    let mode = fs::metadata(b1.data_dir())?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);
    Ok(())
}

#[tokio::test]
async fn test_stop_unmounts_and_resume_remounts() -> Result<()> {
    let ctx = IntegrationTestContext::new().await?;
    let manager = ctx.manager();
    let p1 = project("p1");
    manager.init(&p1, Some(free_port())).await?;
    let main = manager.list_branches(&p1).await?.remove(0);
    fs::write(main.data_dir().join("kept"), b"1")?;

    manager.stop_project(&p1).await?;
    assert!(!main.data_dir().exists());

    manager.resume_project(&p1).await?;
    assert_eq!(fs::read(main.data_dir().join("kept"))?, b"1");
    Ok(())
}
