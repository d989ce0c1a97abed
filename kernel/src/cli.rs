//! Command line interface.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use size::Size;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::branch_manager::{
    BranchError, BranchManager, BranchReport, ErrorKind, ProjectStatus, ProjectSummary,
};
use crate::domain::{Branch, BranchName, ProjectName};

/// dBranch command line.
#[derive(Parser, Debug)]
#[command(name = "dbranch", version, about = "Copy-on-write database branching")]
pub struct Cli {
    /// Configuration file; overrides `DBRANCH_CONFIG`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Project to operate on; the default project when omitted.
    #[arg(short, long, global = true)]
    pub project: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the proxies, route sync and control plane until interrupted.
    Start,
    /// Create a project volume with its `main` branch.
    Init(InitArgs),
    /// Snapshot a branch into a new one.
    Create(CreateArgs),
    /// Make a branch active, starting its database.
    Use(BranchArgs),
    /// Show the project and its branches.
    Status,
    /// List branches of the project.
    List,
    /// List all projects.
    Projects,
    /// Stop all branch databases and unmount the volume.
    Stop,
    /// Mount the volume and restart stopped branches.
    Resume,
    /// Delete a branch and its snapshot.
    Delete(BranchArgs),
    /// Delete a project with all its branches.
    DeleteProject(ProjectArgs),
    /// Make a project the default.
    SetDefault(ProjectArgs),
    /// Show one branch.
    Show(BranchArgs),
    /// Return a failed branch to stopped.
    Reset(BranchArgs),
}

/// Arguments of `init`.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct InitArgs {
    /// Project name.
    pub name: String,
    /// Port the project proxy listens on.
    #[arg(long)]
    pub proxy_port: Option<u16>,
}

/// Arguments of `create`.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    /// New branch name.
    pub name: String,
    /// Branch to snapshot; the active branch when omitted.
    #[arg(short, long)]
    pub source: Option<String>,
}

/// A branch argument.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BranchArgs {
    /// Branch name.
    pub branch: String,
}

/// A project argument.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ProjectArgs {
    /// Project name; `--project` or the default project when omitted.
    pub name: Option<String>,
}

/// Process exit code for a failed command.
#[must_use]
pub fn exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::InvalidInput => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Conflict => 4,
        ErrorKind::State => 5,
        ErrorKind::ResourceExhausted => 6,
        ErrorKind::Dependency => 7,
        ErrorKind::Timeout => 8,
    }
}

/// Runs a one-shot command and returns what to print.
///
/// `start` is not handled here.
///
/// # Errors
///
/// Returns the failing operation's error.
pub async fn execute(cli: &Cli, manager: &BranchManager) -> Result<String, BranchError> {
    let explicit = cli.project.as_deref().map(ProjectName::new).transpose()?;
    let json = cli.json;

    match &cli.command {
        Commands::Start => Err(BranchError::Internal(
            "`start` runs the daemon and is not a one-shot command".into(),
        )),
        Commands::Init(args) => {
            let name = ProjectName::new(args.name.as_str())?;
            let project = manager.init(&name, args.proxy_port).await?;
            let mut out = format!(
                "Initialized project '{}' (proxy port {})",
                project.name, project.proxy_port
            );
            if let Some(main) = manager.list_branches(&name).await?.first() {
                let _ = write!(out, "\nBranch '{}' on port {}", main.name, main.port);
            }
            render(json, &project, out)
        }
        Commands::Create(args) => {
            let project = manager.resolve_project(explicit).await?;
            let name = BranchName::new(args.name.as_str())?;
            let source = args
                .source
                .as_deref()
                .map(BranchName::new)
                .transpose()?;
            let branch = manager.create(&project, &name, source.as_ref()).await?;
            let text = format!(
                "Created branch '{}' from '{}' on port {}",
                branch.name,
                branch.parent.as_ref().map_or("-", BranchName::as_str),
                branch.port
            );
            render(json, &branch, text)
        }
        Commands::Use(args) => {
            let project = manager.resolve_project(explicit).await?;
            let branch = manager
                .use_branch(&project, &BranchName::new(args.branch.as_str())?)
                .await?;
            let text = format!("Switched '{}' to branch '{}'", project, branch.name);
            render(json, &branch, text)
        }
        Commands::Status => {
            let project = manager.resolve_project(explicit).await?;
            let status = manager.status(&project).await?;
            let text = status_table(&status);
            render(json, &status, text)
        }
        Commands::List => {
            let project = manager.resolve_project(explicit).await?;
            let branches = manager.list_branches(&project).await?;
            let text = branch_table(&branches);
            render(json, &branches, text)
        }
        Commands::Projects => {
            let projects = manager.list_projects().await?;
            let text = project_table(&projects);
            render(json, &projects, text)
        }
        Commands::Stop => {
            let project = manager.resolve_project(explicit).await?;
            manager.stop_project(&project).await?;
            Ok(format!("Stopped project '{project}'"))
        }
        Commands::Resume => {
            let project = manager.resolve_project(explicit).await?;
            let branches = manager.resume_project(&project).await?;
            let text = branch_table(&branches);
            render(json, &branches, text)
        }
        Commands::Delete(args) => {
            let project = manager.resolve_project(explicit).await?;
            let branch = BranchName::new(args.branch.as_str())?;
            manager.delete_branch(&project, &branch).await?;
            Ok(format!("Deleted branch '{branch}' of '{project}'"))
        }
        Commands::DeleteProject(args) => {
            let project = project_arg(manager, args, explicit).await?;
            manager.delete_project(&project).await?;
            Ok(format!("Deleted project '{project}'"))
        }
        Commands::SetDefault(args) => {
            let project = project_arg(manager, args, explicit).await?;
            manager.set_default(&project).await?;
            Ok(format!("Default project is now '{project}'"))
        }
        Commands::Show(args) => {
            let project = manager.resolve_project(explicit).await?;
            let report = manager
                .show(&project, &BranchName::new(args.branch.as_str())?)
                .await?;
            let text = report_details(&report);
            render(json, &report, text)
        }
        Commands::Reset(args) => {
            let project = manager.resolve_project(explicit).await?;
            let branch = manager
                .reset_branch(&project, &BranchName::new(args.branch.as_str())?)
                .await?;
            let text = format!("Branch '{}' is {}", branch.name, branch.state);
            render(json, &branch, text)
        }
    }
}

async fn project_arg(
    manager: &BranchManager,
    args: &ProjectArgs,
    explicit: Option<ProjectName>,
) -> Result<ProjectName, BranchError> {
    match args.name.as_deref() {
        Some(name) => Ok(ProjectName::new(name)?),
        None => manager.resolve_project(explicit).await,
    }
}

fn render<T: Serialize>(json: bool, value: &T, text: String) -> Result<String, BranchError> {
    if json {
        serde_json::to_string_pretty(value).map_err(|e| BranchError::Internal(e.to_string()))
    } else {
        Ok(text)
    }
}

fn branch_table(branches: &[Branch]) -> String {
    let mut out = format!(
        "{:<20} {:<20} {:<10} {:<6} Created",
        "Branch", "Parent", "State", "Port"
    );
    for b in branches {
        let _ = write!(
            out,
            "\n{:<20} {:<20} {:<10} {:<6} {}",
            b.name,
            b.parent.as_ref().map_or("-", BranchName::as_str),
            b.state,
            b.port,
            b.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out
}

fn status_table(status: &ProjectStatus) -> String {
    let mut out = format!(
        "Project {} (proxy port {}, {})\n",
        status.project,
        status.proxy_port,
        if status.mounted { "mounted" } else { "stopped" }
    );
    let _ = write!(
        out,
        "  {:<20} {:<10} {:<6} {:<10} {:<12} {:<12} Age",
        "Branch", "State", "Port", "Health", "Size", "Unique Data"
    );
    for r in &status.branches {
        let marker = if r.active { '*' } else { ' ' };
        let health = r
            .health
            .map_or_else(|| "-".to_string(), |h| format!("{h:?}").to_lowercase());
        let (size, unique) = r.usage.as_ref().map_or_else(
            || ("-".to_string(), "-".to_string()),
            |u| (human_size(u.bytes), human_size(u.unique_bytes)),
        );
        let _ = write!(
            out,
            "\n{marker} {:<20} {:<10} {:<6} {:<10} {:<12} {:<12} {}",
            r.name,
            r.state,
            r.port,
            health,
            size,
            unique,
            human_age(r.created_at, Utc::now())
        );
    }
    out
}

fn project_table(projects: &[ProjectSummary]) -> String {
    let mut out = format!("  {:<20} {:<8} {:<20} Created", "Project", "Proxy", "Active");
    for p in projects {
        let marker = if p.default { '*' } else { ' ' };
        let _ = write!(
            out,
            "\n{marker} {:<20} {:<8} {:<20} {}",
            p.name,
            p.proxy_port,
            p.active_branch,
            p.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    out
}

fn report_details(r: &BranchReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Branch:   {}{}", r.name, if r.active { " (active)" } else { "" });
    let _ = writeln!(
        out,
        "Parent:   {}",
        r.parent.as_ref().map_or("-", BranchName::as_str)
    );
    let _ = writeln!(out, "State:    {}", r.state);
    let _ = writeln!(out, "Port:     {}", r.port);
    let _ = writeln!(out, "Path:     {}", r.snapshot_path.display());
    if let Some(usage) = &r.usage {
        let _ = writeln!(out, "Size:     {} in {} files", human_size(usage.bytes), usage.files);
        let _ = writeln!(
            out,
            "Unique:   {} ({} shared)",
            human_size(usage.unique_bytes),
            human_size(usage.shared_bytes)
        );
    }
    let _ = write!(out, "Created:  {}", r.created_at.format("%Y-%m-%d %H:%M:%S"));
    out
}

fn human_size(bytes: u64) -> String {
    Size::from_bytes(bytes).to_string()
}

fn human_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}
