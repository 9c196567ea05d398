//! Workspace snapshots as URL-safe tokens, stored behind short handles.

pub mod codec;
pub mod handle;
pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::WorkspaceLease;
use crate::sandbox::SandboxError;
use crate::workspace::{is_tree_path, normalize_path, File, Workspace};

pub use handle::{AlphabetEncoder, HandleEncoder};
pub use store::{KvStore, MemoryStore, SqliteStore, StoreError};

/// Seeds fed to the handle encoder per attempt.
const SEEDS_PER_HANDLE: usize = 1;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ShareError {
    #[error("could not mint a free share handle after {attempts} attempts")]
    ShareFailed { attempts: usize },

    #[error("could not decode shared workspace: {0}")]
    DecodeFailure(String),

    #[error("could not encode workspace: {0}")]
    Encode(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Where the current content of a file comes from when snapshotting.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn content(&self, path: &str, initial: &File) -> Result<String, SandboxError>;
}

/// The tree's own content, for workspaces without a live sandbox.
pub struct InitialContentSource;

#[async_trait]
impl ContentSource for InitialContentSource {
    async fn content(&self, _path: &str, initial: &File) -> Result<String, SandboxError> {
        Ok(initial.content.clone())
    }
}

/// Live content from a mounted sandbox; files it lacks fall back to the
/// tree's content.
pub struct SandboxContentSource {
    lease: WorkspaceLease,
}

impl SandboxContentSource {
    pub fn new(lease: &WorkspaceLease) -> Self {
        Self {
            lease: lease.clone(),
        }
    }
}

#[async_trait]
impl ContentSource for SandboxContentSource {
    async fn content(&self, path: &str, initial: &File) -> Result<String, SandboxError> {
        match self.lease.handle().read_file(path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(SandboxError::NotFound(_)) => Ok(initial.content.clone()),
            Err(e) => Err(e),
        }
    }
}

/// How to rebuild a workspace from a snapshot.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Paths allowed back in; others are dropped. `None` keeps everything.
    pub allowed_paths: Option<BTreeSet<String>>,
    pub shells: Vec<String>,
    pub initial_file: Option<String>,
    /// Replaces the snapshot's name.
    pub name: Option<String>,
}

impl RestoreOptions {
    pub fn allow<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_paths: Some(paths.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}

/// Result of restoring from a URL fragment. On failure `workspace` is the
/// default and `error` says why.
#[derive(Debug)]
pub struct Restored {
    pub workspace: Workspace,
    pub handle: Option<String>,
    pub error: Option<ShareError>,
}

pub struct ShareService {
    store: Arc<dyn KvStore>,
    encoder: Arc<dyn HandleEncoder>,
    max_attempts: usize,
}

impl ShareService {
    pub fn new(store: Arc<dyn KvStore>, encoder: Arc<dyn HandleEncoder>, max_attempts: usize) -> Self {
        Self {
            store,
            encoder,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Snapshot every file's current content into a token.
    pub async fn compress(
        &self,
        workspace: &Workspace,
        source: &dyn ContentSource,
    ) -> Result<String, ShareError> {
        let mut entries = Vec::new();
        for entry in workspace.files() {
            let content = source.content(entry.path, entry.file).await?;
            entries.push((entry.path.to_string(), entry.file.language.clone(), content));
        }
        let token = codec::encode_snapshot(workspace.name(), &entries)?;
        tracing::debug!(
            workspace = %workspace.name(),
            files = entries.len(),
            token_len = token.len(),
            "workspace compressed"
        );
        Ok(token)
    }

    /// Store `token` under a fresh short handle.
    ///
    /// A handle already holding the same token is reused. A handle holding
    /// something else is a collision and costs one attempt. Records are
    /// only ever inserted, never overwritten.
    pub async fn mint_handle(&self, token: &str) -> Result<String, ShareError> {
        for attempt in 1..=self.max_attempts {
            let seeds = handle::random_seeds(SEEDS_PER_HANDLE)
                .map_err(|e| ShareError::Encode(format!("no entropy for handle: {e}")))?;
            let handle = self.encoder.encode(&seeds);
            let existing = match self.store.get(&handle).await? {
                Some(found) => Some(found),
                None => {
                    if self.store.set_if_absent(&handle, token).await? {
                        tracing::info!(handle = %handle, attempt, "share handle minted");
                        return Ok(handle);
                    }
                    // Lost the insert to a concurrent sharer.
                    self.store.get(&handle).await?
                }
            };
            if existing.as_deref() == Some(token) {
                tracing::debug!(handle = %handle, "reusing share handle with identical snapshot");
                return Ok(handle);
            }
            tracing::warn!(handle = %handle, attempt, "share handle collision");
        }
        Err(ShareError::ShareFailed {
            attempts: self.max_attempts,
        })
    }

    /// Rebuild a workspace from a token.
    pub fn decompress(&self, token: &str, options: &RestoreOptions) -> Result<Workspace, ShareError> {
        let (name, entries) = codec::decode_snapshot(token)?;
        let total = entries.len();
        let kept: Vec<_> = entries
            .into_iter()
            .filter(|(path, _, _)| {
                if !is_tree_path(path) {
                    tracing::debug!(path = %path, "snapshot path outside the tree dropped");
                    return false;
                }
                match &options.allowed_paths {
                    Some(allowed) => allowed.contains(&normalize_path(path)),
                    None => true,
                }
            })
            .collect();
        if kept.len() < total {
            tracing::debug!(dropped = total - kept.len(), "snapshot files dropped on restore");
        }

        let name = options.name.clone().unwrap_or(name);
        let mut workspace = Workspace::from_entries(name, kept).with_shells(options.shells.clone());
        if let Some(initial) = &options.initial_file {
            if workspace.contains(initial) {
                workspace = workspace.with_initial_file(initial.clone());
            } else {
                tracing::debug!(path = %initial, "initial file not in restored workspace");
            }
        }
        Ok(workspace)
    }

    /// `compress` then `mint_handle`.
    pub async fn share(
        &self,
        workspace: &Workspace,
        source: &dyn ContentSource,
    ) -> Result<String, ShareError> {
        let token = self.compress(workspace, source).await?;
        self.mint_handle(&token).await
    }

    pub async fn resolve(&self, handle: &str, options: &RestoreOptions) -> Result<Workspace, ShareError> {
        let token = self
            .store
            .get(handle)
            .await?
            .ok_or_else(|| ShareError::DecodeFailure(format!("unknown share handle '{handle}'")))?;
        self.decompress(&token, options)
    }

    /// Restore from a `#<handle>` fragment (a full URL works too). No
    /// fragment, or any failure, yields `default`.
    pub async fn restore_from_fragment(
        &self,
        fragment: Option<&str>,
        options: &RestoreOptions,
        default: Workspace,
    ) -> Restored {
        let Some(handle) = fragment.and_then(parse_fragment) else {
            return Restored {
                workspace: default,
                handle: None,
                error: None,
            };
        };
        match self.resolve(&handle, options).await {
            Ok(workspace) => Restored {
                workspace,
                handle: Some(handle),
                error: None,
            },
            Err(e) => {
                tracing::warn!(handle = %handle, error = %e, "restoring shared workspace failed");
                Restored {
                    workspace: default,
                    handle: Some(handle),
                    error: Some(e),
                }
            }
        }
    }
}

/// Extract the handle from `#abc`, `abc` or `https://host/path#abc`.
pub fn parse_fragment(fragment: &str) -> Option<String> {
    let raw = match fragment.rsplit_once('#') {
        Some((_, after)) => after,
        None => fragment,
    };
    let handle = raw.trim();
    (!handle.is_empty()).then(|| handle.to_string())
}
