use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn};

use crate::domain::{BranchName, BranchState, ProjectName};
use crate::events::{BranchEvent, EventBus, EventError, EventReceiver};

/// Audit record.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    SystemStartup {
        component: String,
    },
    SystemShutdown {
        reason: String,
    },
    ProjectInitialized {
        project: ProjectName,
        proxy_port: u16,
    },
    ProjectDeleted {
        project: ProjectName,
    },
    BranchCreated {
        project: ProjectName,
        branch: BranchName,
        parent: BranchName,
        port: u16,
    },
    BranchSwitched {
        project: ProjectName,
        from: BranchName,
        to: BranchName,
    },
    BranchDeleted {
        project: ProjectName,
        branch: BranchName,
        port: u16,
    },
    BranchFailed {
        project: ProjectName,
        branch: BranchName,
        from: BranchState,
    },
}

impl AuditEvent {
    /// Audit view of a lifecycle event. Routine transitions and route churn
    /// are not audited.
    #[must_use]
    pub fn from_branch_event(event: &BranchEvent) -> Option<Self> {
        let audit = match event.clone() {
            BranchEvent::ProjectInitialized {
                project,
                proxy_port,
            } => Self::ProjectInitialized {
                project,
                proxy_port,
            },
            BranchEvent::ProjectDeleted { project } => Self::ProjectDeleted { project },
            BranchEvent::BranchCreated {
                project,
                branch,
                parent,
                port,
            } => Self::BranchCreated {
                project,
                branch,
                parent,
                port,
            },
            BranchEvent::BranchSwitched { project, from, to } => {
                Self::BranchSwitched { project, from, to }
            }
            BranchEvent::BranchDeleted {
                project,
                branch,
                port,
            } => Self::BranchDeleted {
                project,
                branch,
                port,
            },
            BranchEvent::StateChanged {
                project,
                branch,
                from,
                to: BranchState::Failed,
            } => Self::BranchFailed {
                project,
                branch,
                from,
            },
            BranchEvent::StateChanged { .. }
            | BranchEvent::RoutePublished { .. }
            | BranchEvent::RouteWithdrawn { .. } => return None,
        };
        Some(audit)
    }
}

/// Logs an audit event to the dedicated audit channel as structured JSON.
/// This uses a specific `target` which can be filtered by the subscriber to redirect to a secure file.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Audit Event");
}

/// Forwards lifecycle events from `bus` to the audit channel until the bus closes.
pub fn spawn_audit_listener(bus: &EventBus) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(audit) = AuditEvent::from_branch_event(&event) {
                        log_audit(&audit);
                    }
                }
                Err(EventError::Lagged(n)) => {
                    warn!(target: "audit", skipped = n, "Audit listener lagged; events dropped");
                }
                Err(EventError::Closed) => return,
            }
        }
    })
}

/// Audits every event already queued on `events`.
///
/// Used by short-lived commands that exit before a listener task would run.
pub fn flush_audit(events: &mut EventReceiver) {
    while let Some(event) = events.try_recv() {
        if let Some(audit) = AuditEvent::from_branch_event(&event) {
            log_audit(&audit);
        }
    }
}
