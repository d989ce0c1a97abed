//! Table definitions, applied idempotently on connect.

pub(super) const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS projects (
        name          TEXT PRIMARY KEY NOT NULL,
        device        TEXT NOT NULL,
        mount_point   TEXT NOT NULL,
        proxy_port    INTEGER NOT NULL UNIQUE,
        active_branch TEXT NOT NULL,
        created_at    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS branches (
        project       TEXT NOT NULL REFERENCES projects(name) ON DELETE CASCADE,
        name          TEXT NOT NULL,
        parent        TEXT,
        snapshot_path TEXT NOT NULL,
        port          INTEGER NOT NULL UNIQUE,
        status        TEXT NOT NULL,
        process_ref   TEXT,
        created_at    TEXT NOT NULL,
        PRIMARY KEY (project, name)
    )",
    "CREATE INDEX IF NOT EXISTS branches_by_parent ON branches (project, parent)",
    "CREATE TABLE IF NOT EXISTS settings (
        key   TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )",
];

pub(super) const DEFAULT_PROJECT_KEY: &str = "default_project";
