use std::collections::BTreeMap;
use std::path::PathBuf;

// ── Identity ────────────────────────────────────────────────────────

/// Proof that the runtime has booted. Cheap to clone; only the
/// `SandboxRuntimeClient` mints these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeToken {
    pub runtime_id: String,
    pub booted_at_unix_ms: i64,
}

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackendKind {
    LocalHost,
    Memory,
}

impl std::fmt::Display for SandboxBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxBackendKind::LocalHost => write!(f, "local"),
            SandboxBackendKind::Memory => write!(f, "memory"),
        }
    }
}

// ── Metadata ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxMetadata {
    pub workspace: String,
    /// Guest path the workspace tree is mounted under.
    pub mount_root: String,
    pub created_at_unix_ms: i64,
}

// ── Shell model ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellRequest {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            cols: 80,
            rows: 24,
        }
    }
}

// ── Backend config ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SandboxRuntimeConfig {
    LocalHost(LocalHostConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct LocalHostConfig {
    /// Each mounted workspace gets a directory under here.
    pub root_dir: PathBuf,
    /// Shell binary spawned for terminal sessions.
    pub shell: String,
    /// Host environment variables passed through to shells.
    pub inherit_env_allowlist: Vec<String>,
}

impl Default for LocalHostConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("playbox-sandboxes"),
            shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into()),
            inherit_env_allowlist: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "TERM".into(),
            ],
        }
    }
}
