use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::domain::ProjectName;

/// Per-project async mutexes serializing structural operations.
#[derive(Debug, Default)]
pub(super) struct ProjectLocks {
    locks: Mutex<HashMap<ProjectName, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one structural operation on a project.
#[derive(Debug)]
pub struct ProjectGuard {
    project: ProjectName,
    _guard: OwnedMutexGuard<()>,
}

impl ProjectGuard {
    /// Project this guard locks.
    #[must_use]
    pub fn project(&self) -> &ProjectName {
        &self.project
    }
}

impl ProjectLocks {
    pub(super) async fn lock(&self, project: &ProjectName) -> ProjectGuard {
        let lock = self
            .locks
            .lock()
            .entry(project.clone())
            .or_default()
            .clone();
        ProjectGuard {
            project: project.clone(),
            _guard: lock.lock_owned().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_project_is_serialized() {
        let locks = Arc::new(ProjectLocks::default());
        let p1 = ProjectName::new("p1").unwrap();

        let guard = locks.lock(&p1).await;
        let contender = {
            let locks = locks.clone();
            let p1 = p1.clone();
            tokio::spawn(async move { locks.lock(&p1).await.project().clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        assert_eq!(contender.await.unwrap(), p1);
    }

    #[tokio::test]
    async fn different_projects_proceed_in_parallel() {
        let locks = ProjectLocks::default();
        let _a = locks.lock(&ProjectName::new("a").unwrap()).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&ProjectName::new("b").unwrap()),
        )
        .await;
        assert!(b.is_ok());
    }
}
