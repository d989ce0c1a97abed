//! Domain model shared by the store, the branch manager and the proxy.

mod names;
mod state;

pub use names::{BranchName, NameError, ProjectName};
pub use state::{BranchState, InvalidTransition, UnknownState};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Directory inside a branch subvolume that the database uses as its data dir.
pub const DATA_DIR: &str = "data";

/// A project: one CoW volume holding a tree of branches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    /// Unique project name.
    pub name: ProjectName,
    /// Backing device or root path of the project volume.
    pub device: PathBuf,
    /// Where the volume is mounted; branch subvolumes live under it.
    pub mount_point: PathBuf,
    /// External port the proxy listens on for this project.
    pub proxy_port: u16,
    /// Branch currently reachable through the proxy.
    pub active_branch: BranchName,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Path of the subvolume that backs `branch`.
    #[must_use]
    pub fn subvolume_path(&self, branch: &BranchName) -> PathBuf {
        self.mount_point.join(branch.as_str())
    }
}

/// A branch: one snapshot, one port, at most one database process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    /// Owning project.
    pub project: ProjectName,
    /// Branch name, unique within the project.
    pub name: BranchName,
    /// Branch this one was snapshotted from; `None` only for `main`.
    pub parent: Option<BranchName>,
    /// Subvolume holding this branch's data.
    pub snapshot_path: PathBuf,
    /// Port the branch's database listens on.
    pub port: u16,
    /// Lifecycle state.
    pub state: BranchState,
    /// Runtime-specific handle of the running process, if any.
    pub process_ref: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Branch {
    /// Data directory handed to the database process.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.snapshot_path.join(DATA_DIR)
    }

    /// Whether this branch was snapshotted from `other`.
    #[must_use]
    pub fn is_child_of(&self, other: &BranchName) -> bool {
        self.parent.as_ref() == Some(other)
    }

    /// Name of the process/container backing this branch.
    #[must_use]
    pub fn process_name(&self) -> String {
        format!("{}_{}", self.project, self.name)
    }
}

/// Orders `branches` so that every child precedes its parent.
///
/// Branches are an arena keyed by name; the walk only follows `parent` ids.
/// Branches whose parent is missing from the slice are treated as roots.
#[must_use]
pub fn children_first(branches: &[Branch]) -> Vec<Branch> {
    fn depth(branch: &Branch, branches: &[Branch]) -> usize {
        let mut depth = 0;
        let mut cursor = branch.parent.clone();
        while let Some(parent) = cursor {
            // Guards against a corrupt store containing a parent cycle.
            if depth > branches.len() {
                break;
            }
            depth += 1;
            cursor = branches
                .iter()
                .find(|b| b.name == parent)
                .and_then(|b| b.parent.clone());
        }
        depth
    }

    let mut ordered: Vec<(usize, Branch)> = branches
        .iter()
        .map(|b| (depth(b, branches), b.clone()))
        .collect();
    ordered.sort_by(|(da, a), (db, b)| db.cmp(da).then_with(|| a.name.cmp(&b.name)));
    ordered.into_iter().map(|(_, b)| b).collect()
}

/// Joins the data directory onto a subvolume path.
#[must_use]
pub fn data_dir_of(subvolume: &Path) -> PathBuf {
    subvolume.join(DATA_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str, parent: Option<&str>) -> Branch {
        Branch {
            project: ProjectName::new("p1").unwrap(),
            name: BranchName::new(name).unwrap(),
            parent: parent.map(|p| BranchName::new(p).unwrap()),
            snapshot_path: PathBuf::from(format!("/mnt/p1/{name}")),
            port: 7000,
            state: BranchState::Stopped,
            process_ref: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn children_come_before_parents() {
        let branches = vec![
            branch("main", None),
            branch("a", Some("main")),
            branch("a1", Some("a")),
            branch("b", Some("main")),
        ];
        let order: Vec<String> = children_first(&branches)
            .into_iter()
            .map(|b| b.name.to_string())
            .collect();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("a1") < pos("a"));
        assert!(pos("a") < pos("main"));
        assert!(pos("b") < pos("main"));
        assert_eq!(order.last().map(String::as_str), Some("main"));
    }

    #[test]
    fn orphaned_parent_reference_is_a_root() {
        let branches = vec![branch("x", Some("gone"))];
        assert_eq!(children_first(&branches).len(), 1);
    }

    #[test]
    fn data_dir_lives_inside_the_snapshot() {
        let b = branch("b1", Some("main"));
        assert_eq!(b.data_dir(), PathBuf::from("/mnt/p1/b1/data"));
        assert_eq!(b.process_name(), "p1_b1");
    }
}
