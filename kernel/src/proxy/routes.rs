use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::domain::{BranchName, ProjectName};

/// Where new connections for a project go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Branch serving the project.
    pub branch: BranchName,
    /// Address of the branch database.
    pub backend: SocketAddr,
}

/// Shared project → route map.
///
/// Routes are immutable and replaced wholesale, so a reader holds either the
/// old or the new route, never a mix.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<ProjectName, Arc<Route>>>>,
}

impl RouteTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the project's route, returning the previous one.
    pub fn publish(&self, project: &ProjectName, route: Route) -> Option<Arc<Route>> {
        self.routes.write().insert(project.clone(), Arc::new(route))
    }

    /// Removes the project's route so new connections are refused.
    pub fn withdraw(&self, project: &ProjectName) -> Option<Arc<Route>> {
        self.routes.write().remove(project)
    }

    /// Current route of a project.
    #[must_use]
    pub fn resolve(&self, project: &ProjectName) -> Option<Arc<Route>> {
        self.routes.read().get(project).cloned()
    }

    /// Every published route, sorted by project.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ProjectName, Arc<Route>)> {
        let mut all: Vec<_> = self
            .routes
            .read()
            .iter()
            .map(|(p, r)| (p.clone(), Arc::clone(r)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
