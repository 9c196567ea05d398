use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::SandboxError;
use super::types::*;

/// Handle to one booted, mounted sandbox.
///
/// Backends implement this trait. The workspace cache owns every handle;
/// other components only ever borrow one through a lease.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    fn id(&self) -> &str;
    fn backend_kind(&self) -> SandboxBackendKind;
    fn metadata(&self) -> &SandboxMetadata;

    // ── Files ───────────────────────────────────────────────────

    /// Write `bytes` at a workspace-relative path, creating parents.
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError>;

    /// Read a workspace-relative path. Missing files are `NotFound`.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError>;

    // ── Processes ───────────────────────────────────────────────

    async fn spawn_shell(&self, req: ShellRequest) -> Result<ShellSession, SandboxError>;

    // ── Lifecycle ───────────────────────────────────────────────

    /// Kill every process spawned from this handle and remove the mount.
    async fn unmount(&self) -> Result<(), SandboxError>;
}

/// A freshly spawned shell: a control handle plus its output stream.
///
/// `output` yields combined stdout/stderr chunks in emission order and
/// closes once the process has exited and all output is drained.
pub struct ShellSession {
    pub process: Arc<dyn ShellProcess>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Control side of an interactive shell running inside a sandbox.
#[async_trait]
pub trait ShellProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    async fn write_stdin(&self, data: &[u8]) -> Result<(), SandboxError>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError>;

    /// Kill the process. Must succeed even if it already exited.
    async fn kill(&self);
}
