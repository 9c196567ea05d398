use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{SandboxHandle, ShellSession};
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ShellSupervisor;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;
use crate::workspace::Workspace;

/// Best-effort host isolation provider.
///
/// Each mount gets its own directory under `config.root_dir` and shells
/// run as the current user under a PTY with a filtered env.
/// Not a security boundary. Trusted workloads only.
pub struct LocalHostProvider {
    config: LocalHostConfig,
    counter: AtomicU64,
}

impl LocalHostProvider {
    pub fn new(config: LocalHostConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalHostProvider {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalHost
    }

    async fn boot(&self) -> Result<String, SandboxError> {
        if which(&self.config.shell).is_none() {
            return Err(SandboxError::RuntimeUnavailable(format!(
                "shell '{}' not found",
                self.config.shell
            )));
        }
        tokio::fs::create_dir_all(&self.config.root_dir)
            .await
            .map_err(|e| {
                SandboxError::RuntimeUnavailable(format!(
                    "failed to create sandboxes root {}: {e}",
                    self.config.root_dir.display()
                ))
            })?;
        let runtime_id = format!("local-{}", uuid::Uuid::new_v4());
        tracing::info!(
            runtime_id = %runtime_id,
            root = %self.config.root_dir.display(),
            "local sandbox runtime booted"
        );
        Ok(runtime_id)
    }

    async fn mount(&self, workspace: &Workspace) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let sandbox_id = format!("local-{}-{seq}", sanitize(workspace.name()));
        let dir = self.config.root_dir.join(&sandbox_id);

        tracing::info!(
            sandbox_id = %sandbox_id,
            workspace = %workspace.name(),
            dir = %dir.display(),
            files = workspace.paths().len(),
            "mounting workspace on local host"
        );

        let jail = FsJail::mount(dir, workspace).await?;
        let supervisor = ShellSupervisor::new(
            self.config.shell.clone(),
            self.config.inherit_env_allowlist.clone(),
        );
        let metadata = SandboxMetadata {
            workspace: workspace.name().to_string(),
            mount_root: jail.root().display().to_string(),
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
        };

        Ok(Box::new(LocalHandle {
            id: sandbox_id,
            jail: Arc::new(jail),
            supervisor: Arc::new(supervisor),
            metadata,
        }))
    }
}

struct LocalHandle {
    id: String,
    jail: Arc<FsJail>,
    supervisor: Arc<ShellSupervisor>,
    metadata: SandboxMetadata,
}

#[async_trait]
impl SandboxHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalHost
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        tracing::debug!(sandbox_id = %self.id, path, len = bytes.len(), "write");
        self.jail.write(path, bytes).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.jail.read(path).await
    }

    async fn spawn_shell(&self, req: ShellRequest) -> Result<ShellSession, SandboxError> {
        self.supervisor.spawn(&req, self.jail.root())
    }

    async fn unmount(&self) -> Result<(), SandboxError> {
        tracing::info!(sandbox_id = %self.id, "unmounting local sandbox");
        self.supervisor.kill_all().await;
        self.jail.destroy().await
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn which(bin: &str) -> Option<std::path::PathBuf> {
    let path = std::path::Path::new(bin);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{Directory, File};

    fn provider(tmp: &tempfile::TempDir) -> LocalHostProvider {
        LocalHostProvider::new(LocalHostConfig {
            root_dir: tmp.path().join("sandboxes"),
            shell: "/bin/sh".into(),
            inherit_env_allowlist: vec!["PATH".into()],
        })
    }

    fn workspace(name: &str) -> Workspace {
        Workspace::new(
            name,
            vec![
                File::new("index.ts", "console.log(1)").into(),
                Directory::new("src", vec![File::new("a.ts", "export {}").into()]).into(),
            ],
        )
    }

    #[tokio::test]
    async fn boot_creates_root() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(&tmp);
        let id = p.boot().await.unwrap();
        assert!(id.starts_with("local-"));
        assert!(tmp.path().join("sandboxes").is_dir());
    }

    #[tokio::test]
    async fn boot_without_shell_is_runtime_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let p = LocalHostProvider::new(LocalHostConfig {
            root_dir: tmp.path().join("sandboxes"),
            shell: "/no/such/shell".into(),
            inherit_env_allowlist: vec![],
        });
        let err = p.boot().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn mount_read_write_unmount() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(&tmp);
        p.boot().await.unwrap();
        let handle = p.mount(&workspace("demo app")).await.unwrap();

        assert!(handle.id().starts_with("local-demo_app-"));
        assert_eq!(handle.backend_kind(), SandboxBackendKind::LocalHost);
        assert_eq!(handle.read_file("src/a.ts").await.unwrap(), b"export {}");

        handle.write_file("src/a.ts", b"export const x = 1;").await.unwrap();
        assert_eq!(
            handle.read_file("/src/a.ts").await.unwrap(),
            b"export const x = 1;"
        );

        let root = std::path::PathBuf::from(&handle.metadata().mount_root);
        assert!(root.is_dir());
        handle.unmount().await.unwrap();
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn mounts_of_same_workspace_are_isolated() {
        let tmp = tempfile::tempdir().unwrap();
        let p = provider(&tmp);
        let a = p.mount(&workspace("same")).await.unwrap();
        let b = p.mount(&workspace("same")).await.unwrap();
        a.write_file("index.ts", b"changed").await.unwrap();
        assert_eq!(b.read_file("index.ts").await.unwrap(), b"console.log(1)");
    }
}
