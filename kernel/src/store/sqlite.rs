//! `SQLite`-backed branch registry.
//!
//! Every mutation runs in its own transaction and is committed before the
//! call returns. Invariants that span rows (active pointer validity, port
//! uniqueness, child references) are checked inside the same transaction
//! that changes them.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::error::StoreError;
use super::locks::{ProjectGuard, ProjectLocks};
use super::schema::{DEFAULT_PROJECT_KEY, MIGRATIONS};
use crate::domain::{Branch, BranchName, BranchState, Project, ProjectName};

/// Durable registry of projects and their branch trees.
#[derive(Debug)]
pub struct BranchStore {
    pool: SqlitePool,
    locks: ProjectLocks,
}

impl BranchStore {
    /// Opens (creating if needed) the store at `url` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the database cannot be opened.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let file = options.get_filename();
        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::DbError(sqlx::Error::Io(e)))?;
        }

        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// Opens a private in-memory store, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Each in-memory connection is its own database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!("Branch store schema ready");
        Ok(Self {
            pool,
            locks: ProjectLocks::default(),
        })
    }

    /// Waits for exclusive structural access to `project`.
    pub async fn lock_project(&self, project: &ProjectName) -> ProjectGuard {
        self.locks.lock(project).await
    }

    /// Registers a project together with its root branch, which becomes active.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectExists`] or [`StoreError::PortInUse`].
    #[instrument(skip(self, project, root), fields(project = %project.name))]
    pub async fn create_project(&self, project: &Project, root: &Branch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        if project_exists(&mut tx, &project.name).await? {
            return Err(StoreError::ProjectExists(project.name.clone()));
        }
        let proxy_taken: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM projects WHERE proxy_port = ?")
                .bind(i64::from(project.proxy_port))
                .fetch_optional(&mut *tx)
                .await?;
        if proxy_taken.is_some() {
            return Err(StoreError::PortInUse(project.proxy_port));
        }

        sqlx::query(
            "INSERT INTO projects (name, device, mount_point, proxy_port, active_branch, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(project.name.as_str())
        .bind(project.device.to_string_lossy())
        .bind(project.mount_point.to_string_lossy())
        .bind(i64::from(project.proxy_port))
        .bind(root.name.as_str())
        .bind(project.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .execute(&mut *tx)
        .await?;

        insert_branch(&mut tx, root).await?;
        tx.commit().await?;
        info!("Project registered");
        Ok(())
    }

    /// Loads a project.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`] if it does not exist.
    pub async fn get_project(&self, name: &ProjectName) -> Result<Project, StoreError> {
        sqlx::query("SELECT * FROM projects WHERE name = ?")
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| project_from_row(&row))
            .transpose()?
            .ok_or_else(|| StoreError::ProjectNotFound(name.clone()))
    }

    /// All projects ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is corrupt.
    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        sqlx::query("SELECT * FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(project_from_row)
            .collect()
    }

    /// Removes a project and, by cascade, all of its branch records.
    ///
    /// Clears the default project setting if it pointed here.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`] if it does not exist.
    #[instrument(skip(self))]
    pub async fn delete_project(&self, name: &ProjectName) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM projects WHERE name = ?")
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::ProjectNotFound(name.clone()));
        }
        sqlx::query("DELETE FROM settings WHERE key = ? AND value = ?")
            .bind(DEFAULT_PROJECT_KEY)
            .bind(name.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!("Project removed");
        Ok(())
    }

    /// Records a new branch.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`], [`StoreError::BranchExists`],
    /// [`StoreError::BranchNotFound`] for a missing parent, or
    /// [`StoreError::PortInUse`].
    #[instrument(skip(self, branch), fields(project = %branch.project, branch = %branch.name))]
    pub async fn record_branch(&self, branch: &Branch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if !project_exists(&mut tx, &branch.project).await? {
            return Err(StoreError::ProjectNotFound(branch.project.clone()));
        }
        if let Some(parent) = &branch.parent {
            fetch_branch(&mut tx, &branch.project, parent).await?;
        }
        insert_branch(&mut tx, branch).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Moves a branch to `to`, enforcing the lifecycle. Returns the previous state.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::BranchNotFound`] or [`StoreError::Transition`].
    #[instrument(skip(self))]
    pub async fn update_branch_status(
        &self,
        project: &ProjectName,
        branch: &BranchName,
        to: BranchState,
    ) -> Result<BranchState, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = fetch_branch(&mut tx, project, branch).await?.state;
        current.transition_to(to)?;
        sqlx::query("UPDATE branches SET status = ? WHERE project = ? AND name = ?")
            .bind(to.as_str())
            .bind(project.as_str())
            .bind(branch.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("{} -> {}", current, to);
        Ok(current)
    }

    /// Stores (or clears) the runtime handle of a branch's process.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::BranchNotFound`].
    pub async fn set_process_ref(
        &self,
        project: &ProjectName,
        branch: &BranchName,
        process_ref: Option<&str>,
    ) -> Result<(), StoreError> {
        let updated =
            sqlx::query("UPDATE branches SET process_ref = ? WHERE project = ? AND name = ?")
                .bind(process_ref)
                .bind(project.as_str())
                .bind(branch.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
        if updated == 0 {
            return Err(branch_not_found(project, branch));
        }
        Ok(())
    }

    /// Removes a branch record.
    ///
    /// Children whose snapshot is complete are re-parented to the removed
    /// branch's parent in the same transaction. Children still being created
    /// copy from this branch and block the removal.
    ///
    /// # Errors
    ///
    /// Refuses with [`StoreError::ActiveBranch`] or [`StoreError::HasChildren`];
    /// fails with [`StoreError::BranchNotFound`] if absent.
    #[instrument(skip(self))]
    pub async fn remove_branch(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = fetch_branch(&mut tx, project, branch).await?;

        if active_name(&mut tx, project).await? == *branch {
            return Err(StoreError::ActiveBranch {
                project: project.clone(),
                branch: branch.clone(),
            });
        }
        let pending: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM branches WHERE project = ? AND parent = ? AND status IN (?, ?) ORDER BY name",
        )
        .bind(project.as_str())
        .bind(branch.as_str())
        .bind(BranchState::Uninitialized.as_str())
        .bind(BranchState::Creating.as_str())
        .fetch_all(&mut *tx)
        .await?;
        if !pending.is_empty() {
            return Err(StoreError::HasChildren {
                project: project.clone(),
                branch: branch.clone(),
                children: pending,
            });
        }

        let reparented = sqlx::query("UPDATE branches SET parent = ? WHERE project = ? AND parent = ?")
            .bind(removed.parent.as_ref().map(BranchName::as_str))
            .bind(project.as_str())
            .bind(branch.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM branches WHERE project = ? AND name = ?")
            .bind(project.as_str())
            .bind(branch.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        if reparented > 0 {
            debug!(reparented, "Re-parented children of removed branch");
        }
        Ok(())
    }

    /// Points the project at `branch`, verifying it exists in the same transaction.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`] or [`StoreError::BranchNotFound`].
    #[instrument(skip(self))]
    pub async fn set_active(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        if !project_exists(&mut tx, project).await? {
            return Err(StoreError::ProjectNotFound(project.clone()));
        }
        fetch_branch(&mut tx, project, branch).await?;
        sqlx::query("UPDATE projects SET active_branch = ? WHERE name = ?")
            .bind(branch.as_str())
            .bind(project.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// The project's active branch.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`], or [`StoreError::Corrupt`]
    /// if the pointer dangles.
    pub async fn get_active(&self, project: &ProjectName) -> Result<Branch, StoreError> {
        let mut tx = self.pool.begin().await?;
        let name = active_name(&mut tx, project).await?;
        let branch = fetch_branch(&mut tx, project, &name).await.map_err(|e| match e {
            StoreError::BranchNotFound { .. } => {
                StoreError::Corrupt(format!("active branch '{name}' of '{project}' is missing"))
            }
            other => other,
        })?;
        tx.commit().await?;
        Ok(branch)
    }

    /// Loads one branch.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::BranchNotFound`].
    pub async fn get_branch(
        &self,
        project: &ProjectName,
        branch: &BranchName,
    ) -> Result<Branch, StoreError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT * FROM branches WHERE project = ? AND name = ?")
            .bind(project.as_str())
            .bind(branch.as_str())
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| branch_from_row(&row))
            .transpose()?
            .ok_or_else(|| branch_not_found(project, branch))
    }

    /// All branches of a project, oldest first.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`].
    pub async fn list_branches(&self, project: &ProjectName) -> Result<Vec<Branch>, StoreError> {
        let mut tx = self.pool.begin().await?;
        if !project_exists(&mut tx, project).await? {
            return Err(StoreError::ProjectNotFound(project.clone()));
        }
        let branches = sqlx::query(
            "SELECT * FROM branches WHERE project = ? ORDER BY created_at, name",
        )
        .bind(project.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(branch_from_row)
        .collect::<Result<Vec<_>, _>>()?;
        tx.commit().await?;
        Ok(branches)
    }

    /// Every branch port currently assigned, across all projects.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn allocated_ports(&self) -> Result<BTreeSet<u16>, StoreError> {
        let ports: Vec<i64> = sqlx::query_scalar(
            "SELECT port FROM branches UNION SELECT proxy_port FROM projects",
        )
        .fetch_all(&self.pool)
        .await?;
        ports.into_iter().map(decode_port).collect()
    }

    /// Sets or clears the default project.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ProjectNotFound`] if the project does not exist.
    pub async fn set_default_project(
        &self,
        project: Option<&ProjectName>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match project {
            Some(name) => {
                if !project_exists(&mut tx, name).await? {
                    return Err(StoreError::ProjectNotFound(name.clone()));
                }
                sqlx::query(
                    "INSERT INTO settings (key, value) VALUES (?, ?)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )
                .bind(DEFAULT_PROJECT_KEY)
                .bind(name.as_str())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM settings WHERE key = ?")
                    .bind(DEFAULT_PROJECT_KEY)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// The default project, if one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored name is invalid.
    pub async fn default_project(&self) -> Result<Option<ProjectName>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
                .bind(DEFAULT_PROJECT_KEY)
                .fetch_optional(&self.pool)
                .await?;
        value
            .map(|v| ProjectName::new(v).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn project_exists(
    tx: &mut Transaction<'_, Sqlite>,
    name: &ProjectName,
) -> Result<bool, StoreError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM projects WHERE name = ?")
        .bind(name.as_str())
        .fetch_optional(&mut **tx)
        .await?;
    Ok(found.is_some())
}

async fn active_name(
    tx: &mut Transaction<'_, Sqlite>,
    project: &ProjectName,
) -> Result<BranchName, StoreError> {
    let name: Option<String> =
        sqlx::query_scalar("SELECT active_branch FROM projects WHERE name = ?")
            .bind(project.as_str())
            .fetch_optional(&mut **tx)
            .await?;
    let name = name.ok_or_else(|| StoreError::ProjectNotFound(project.clone()))?;
    BranchName::new(name).map_err(|e| StoreError::Corrupt(e.to_string()))
}

async fn fetch_branch(
    tx: &mut Transaction<'_, Sqlite>,
    project: &ProjectName,
    branch: &BranchName,
) -> Result<Branch, StoreError> {
    sqlx::query("SELECT * FROM branches WHERE project = ? AND name = ?")
        .bind(project.as_str())
        .bind(branch.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| branch_from_row(&row))
        .transpose()?
        .ok_or_else(|| branch_not_found(project, branch))
}

async fn insert_branch(
    tx: &mut Transaction<'_, Sqlite>,
    branch: &Branch,
) -> Result<(), StoreError> {
    let duplicate: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM branches WHERE project = ? AND name = ?")
            .bind(branch.project.as_str())
            .bind(branch.name.as_str())
            .fetch_optional(&mut **tx)
            .await?;
    if duplicate.is_some() {
        return Err(StoreError::BranchExists {
            project: branch.project.clone(),
            branch: branch.name.clone(),
        });
    }

    let port_taken: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM branches WHERE port = ?1 UNION SELECT 1 FROM projects WHERE proxy_port = ?1",
    )
    .bind(i64::from(branch.port))
    .fetch_optional(&mut **tx)
    .await?;
    if port_taken.is_some() {
        return Err(StoreError::PortInUse(branch.port));
    }

    sqlx::query(
        "INSERT INTO branches
            (project, name, parent, snapshot_path, port, status, process_ref, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(branch.project.as_str())
    .bind(branch.name.as_str())
    .bind(branch.parent.as_ref().map(BranchName::as_str))
    .bind(branch.snapshot_path.to_string_lossy())
    .bind(i64::from(branch.port))
    .bind(branch.state.as_str())
    .bind(branch.process_ref.as_deref())
    .bind(branch.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn branch_not_found(project: &ProjectName, branch: &BranchName) -> StoreError {
    StoreError::BranchNotFound {
        project: project.clone(),
        branch: branch.clone(),
    }
}

fn corrupt(e: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(e.to_string())
}

fn decode_port(port: i64) -> Result<u16, StoreError> {
    u16::try_from(port).map_err(|_| StoreError::Corrupt(format!("port {port} out of range")))
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(corrupt)
}

fn project_from_row(row: &SqliteRow) -> Result<Project, StoreError> {
    Ok(Project {
        name: ProjectName::new(row.try_get::<String, _>("name")?).map_err(corrupt)?,
        device: PathBuf::from(row.try_get::<String, _>("device")?),
        mount_point: PathBuf::from(row.try_get::<String, _>("mount_point")?),
        proxy_port: decode_port(row.try_get("proxy_port")?)?,
        active_branch: BranchName::new(row.try_get::<String, _>("active_branch")?)
            .map_err(corrupt)?,
        created_at: decode_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn branch_from_row(row: &SqliteRow) -> Result<Branch, StoreError> {
    let parent: Option<String> = row.try_get("parent")?;
    Ok(Branch {
        project: ProjectName::new(row.try_get::<String, _>("project")?).map_err(corrupt)?,
        name: BranchName::new(row.try_get::<String, _>("name")?).map_err(corrupt)?,
        parent: parent.map(BranchName::new).transpose().map_err(corrupt)?,
        snapshot_path: PathBuf::from(row.try_get::<String, _>("snapshot_path")?),
        port: decode_port(row.try_get("port")?)?,
        state: row
            .try_get::<String, _>("status")?
            .parse::<BranchState>()
            .map_err(corrupt)?,
        process_ref: row.try_get("process_ref")?,
        created_at: decode_time(&row.try_get::<String, _>("created_at")?)?,
    })
}
