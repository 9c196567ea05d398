use async_trait::async_trait;

use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::SandboxBackendKind;
use crate::workspace::Workspace;

/// Factory for booting the runtime and mounting workspaces.
///
/// One provider instance lives inside the `SandboxRuntimeClient`; the
/// client guarantees `boot()` runs at most once per process.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> SandboxBackendKind;

    /// Bring up the underlying runtime. Returns a runtime id.
    /// `RuntimeUnavailable` here is fatal for the session.
    async fn boot(&self) -> Result<String, SandboxError>;

    /// Materialize a workspace's tree into a fresh sandbox.
    async fn mount(&self, workspace: &Workspace) -> Result<Box<dyn SandboxHandle>, SandboxError>;
}
