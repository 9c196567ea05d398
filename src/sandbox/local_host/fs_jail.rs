use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;
use crate::workspace::Workspace;

/// Workspace directory on the host with path containment.
///
/// Every guest path is resolved against `root` and rejected if it would
/// climb out of it. Not a chroot: the local backend trusts its workloads.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create the jail directory and write every file of `workspace` into it.
    /// A failed write removes the partial directory.
    pub async fn mount(root: PathBuf, workspace: &Workspace) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            SandboxError::Mount(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        let jail = Self { root };
        for entry in workspace.files() {
            if let Err(e) = jail.write(entry.path, entry.file.content.as_bytes()).await {
                if let Err(cleanup) = jail.destroy().await {
                    tracing::warn!(
                        root = %jail.root.display(),
                        error = %cleanup,
                        "failed to remove partially mounted workspace"
                    );
                }
                return Err(SandboxError::Mount(format!("{}: {e}", entry.path)));
            }
        }
        Ok(jail)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a guest path onto the host, refusing `..` escapes. The file need
    /// not exist.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let guest = Path::new(guest_path);
        let relative = guest.strip_prefix("/").unwrap_or(guest);

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::PathEscape(guest_path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(SandboxError::PathEscape(guest_path.to_string()));
        }
        Ok(self.root.join(normalized))
    }

    pub async fn write(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let path = self.resolve(guest_path)?;
        let io_err = |e: std::io::Error| SandboxError::Write {
            path: guest_path.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io_err)
    }

    pub async fn read(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(guest_path)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::NotFound(guest_path.to_string()))
            }
            Err(e) => Err(SandboxError::Read {
                path: guest_path.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Remove the whole workspace directory.
    pub async fn destroy(&self) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
