use std::sync::{Arc, OnceLock};

use tokio::sync::OnceCell;

use super::error::SandboxError;
use super::handle::{SandboxHandle, ShellProcess, ShellSession};
use super::provider::SandboxProvider;
use super::types::{RuntimeToken, SandboxBackendKind, ShellRequest};
use crate::workspace::Workspace;

/// Process-scoped front door to the sandbox runtime.
///
/// Constructed once at startup and handed to the workspace cache. The
/// underlying runtime is booted at most once: concurrent first callers
/// share one `boot()` and a `RuntimeUnavailable` failure is remembered for
/// the rest of the session.
pub struct SandboxRuntimeClient {
    provider: Arc<dyn SandboxProvider>,
    runtime: OnceCell<RuntimeToken>,
    fatal: OnceLock<SandboxError>,
}

impl SandboxRuntimeClient {
    pub fn new(provider: Arc<dyn SandboxProvider>) -> Self {
        Self {
            provider,
            runtime: OnceCell::new(),
            fatal: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> SandboxBackendKind {
        self.provider.kind()
    }

    pub fn is_booted(&self) -> bool {
        self.runtime.initialized()
    }

    pub async fn boot(&self) -> Result<RuntimeToken, SandboxError> {
        if let Some(err) = self.fatal.get() {
            return Err(err.clone());
        }
        let token = self
            .runtime
            .get_or_try_init(|| async {
                // A waiter may get here after the first caller failed fatally.
                if let Some(err) = self.fatal.get() {
                    return Err(err.clone());
                }
                tracing::info!(backend = %self.provider.kind(), "booting sandbox runtime");
                match self.provider.boot().await {
                    Ok(runtime_id) => Ok(RuntimeToken {
                        runtime_id,
                        booted_at_unix_ms: chrono::Utc::now().timestamp_millis(),
                    }),
                    Err(e) => {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "sandbox runtime unavailable");
                            let _ = self.fatal.set(e.clone());
                        } else {
                            tracing::warn!(error = %e, "sandbox runtime boot failed");
                        }
                        Err(e)
                    }
                }
            })
            .await?;
        Ok(token.clone())
    }

    pub async fn mount(
        &self,
        token: &RuntimeToken,
        workspace: &Workspace,
    ) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        tracing::debug!(
            runtime_id = %token.runtime_id,
            workspace = %workspace.name(),
            "mounting workspace"
        );
        self.provider.mount(workspace).await
    }

    pub async fn unmount(&self, handle: &dyn SandboxHandle) -> Result<(), SandboxError> {
        handle.unmount().await
    }

    pub async fn write(
        &self,
        handle: &dyn SandboxHandle,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        handle.write_file(path, bytes).await
    }

    pub async fn read(&self, handle: &dyn SandboxHandle, path: &str) -> Result<Vec<u8>, SandboxError> {
        handle.read_file(path).await
    }

    pub async fn spawn_shell(
        &self,
        handle: &dyn SandboxHandle,
        req: ShellRequest,
    ) -> Result<ShellSession, SandboxError> {
        let session = handle.spawn_shell(req).await?;
        tracing::info!(
            sandbox_id = %handle.id(),
            pid = ?session.process.pid(),
            "shell spawned"
        );
        Ok(session)
    }

    pub async fn resize(
        &self,
        process: &dyn ShellProcess,
        cols: u16,
        rows: u16,
    ) -> Result<(), SandboxError> {
        process.resize(cols, rows).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::memory::MemoryProvider;
    use crate::workspace::File;

    fn client_with(provider: Arc<MemoryProvider>) -> Arc<SandboxRuntimeClient> {
        Arc::new(SandboxRuntimeClient::new(provider))
    }

    #[tokio::test]
    async fn boot_is_idempotent() {
        let provider = Arc::new(MemoryProvider::new());
        let client = client_with(provider.clone());
        let a = client.boot().await.unwrap();
        let b = client.boot().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(provider.stats().boots, 1);
        assert!(client.is_booted());
    }

    #[tokio::test]
    async fn concurrent_first_boots_collapse() {
        let provider = Arc::new(MemoryProvider::new());
        let client = client_with(provider.clone());
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.boot().await })
            })
            .collect();
        let mut tokens = Vec::new();
        for t in tasks {
            tokens.push(t.await.unwrap().unwrap());
        }
        assert!(tokens.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(provider.stats().boots, 1);
    }

    #[tokio::test]
    async fn runtime_unavailable_is_sticky() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_boot("no isolation");
        let client = client_with(provider.clone());

        assert!(client.boot().await.unwrap_err().is_fatal());
        assert!(client.boot().await.unwrap_err().is_fatal());
        assert_eq!(provider.stats().boots, 1);
        assert!(!client.is_booted());
    }

    #[tokio::test]
    async fn mount_and_io_go_through_handle() {
        let provider = Arc::new(MemoryProvider::new());
        let client = client_with(provider.clone());
        let token = client.boot().await.unwrap();
        let ws = Workspace::new("io", vec![File::new("a.ts", "1").into()]);
        let handle = client.mount(&token, &ws).await.unwrap();

        client.write(handle.as_ref(), "a.ts", b"2").await.unwrap();
        assert_eq!(client.read(handle.as_ref(), "a.ts").await.unwrap(), b"2");

        let session = client
            .spawn_shell(handle.as_ref(), ShellRequest::default())
            .await
            .unwrap();
        client.resize(session.process.as_ref(), 100, 30).await.unwrap();
        assert_eq!(provider.shells()[0].resizes(), vec![(80, 24), (100, 30)]);

        client.unmount(handle.as_ref()).await.unwrap();
        assert_eq!(provider.stats().unmounts, 1);
    }
}
