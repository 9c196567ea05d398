//! Keeps one editor surface and a sandbox filesystem in step.
//!
//! Loads go sandbox → editor, edits go editor → sandbox through a trailing
//! debounce. Loading a file never writes it back.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cache::WorkspaceLease;
use crate::debounce::Debouncer;
use crate::sandbox::SandboxError;
use crate::workspace::{normalize_path, Workspace};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct EditorConfig {
    pub write_debounce: Duration,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            write_debounce: Duration::from_millis(1000),
        }
    }
}

/// Scroll, cursor and folding state of one file in the editor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub scroll_top: f64,
    pub scroll_left: f64,
    pub cursor_line: u32,
    pub cursor_column: u32,
    /// Folded line ranges, inclusive.
    pub folded: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedFile {
    pub path: String,
    pub content: String,
    /// `None` when the file has not been visited in this session.
    pub view_state: Option<ViewState>,
}

struct PendingWrite {
    path: String,
    content: String,
}

pub struct EditorSession {
    lease: WorkspaceLease,
    workspace: Workspace,
    active: Option<String>,
    last_known: HashMap<String, String>,
    view_states: HashMap<String, ViewState>,
    changes: broadcast::Sender<ContentChange>,
    writer: Debouncer<PendingWrite>,
}

impl EditorSession {
    /// Open a session over a leased sandbox, loading the workspace's initial
    /// file if it declares one.
    pub async fn open(
        lease: &WorkspaceLease,
        workspace: &Workspace,
        config: EditorConfig,
    ) -> Result<(Self, Option<LoadedFile>), SandboxError> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let write_lease = lease.clone();
        let writer = Debouncer::spawn(config.write_debounce, move |write: PendingWrite| {
            let lease = write_lease.clone();
            async move {
                match lease.handle().write_file(&write.path, write.content.as_bytes()).await {
                    Ok(()) => tracing::debug!(
                        sandbox_id = %lease.sandbox_id(),
                        path = %write.path,
                        len = write.content.len(),
                        "editor write applied"
                    ),
                    // The next debounced write carries the full content again.
                    Err(e) => tracing::warn!(
                        sandbox_id = %lease.sandbox_id(),
                        path = %write.path,
                        error = %e,
                        "editor write failed"
                    ),
                }
            }
        });

        let mut session = Self {
            lease: lease.clone(),
            workspace: workspace.clone(),
            active: None,
            last_known: HashMap::new(),
            view_states: HashMap::new(),
            changes,
            writer,
        };

        let initial = match workspace.initial_file() {
            Some(path) => Some(session.select_file(path, None).await?),
            None => None,
        };
        Ok((session, initial))
    }

    pub fn active_path(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn view_state(&self, path: &str) -> Option<&ViewState> {
        self.view_states.get(&normalize_path(path))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentChange> {
        self.changes.subscribe()
    }

    /// Switch the editor to `path`.
    ///
    /// The outgoing file's view state is saved and its pending write is
    /// flushed before the incoming file is read.
    pub async fn select_file(
        &mut self,
        path: &str,
        outgoing_view: Option<ViewState>,
    ) -> Result<LoadedFile, SandboxError> {
        let path = normalize_path(path);
        if let Some(outgoing) = self.active.take() {
            if let Some(view) = outgoing_view {
                self.view_states.insert(outgoing, view);
            }
            self.writer.flush().await;
        }

        let content = self.load(&path).await?;
        self.last_known.insert(path.clone(), content.clone());
        self.active = Some(path.clone());
        tracing::debug!(path = %path, len = content.len(), "editor loaded file");

        Ok(LoadedFile {
            view_state: self.view_states.get(&path).cloned(),
            path,
            content,
        })
    }

    async fn load(&self, path: &str) -> Result<String, SandboxError> {
        match self.lease.handle().read_file(path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => match self.workspace.file(path) {
                Some(file) => {
                    if !matches!(e, SandboxError::NotFound(_)) {
                        tracing::warn!(path, error = %e, "sandbox read failed; using initial content");
                    }
                    Ok(file.content.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Record new editor content for the active file.
    ///
    /// Returns `false` when nothing changed: no file is active, or the
    /// content equals what was last loaded or edited.
    pub fn edit(&mut self, content: impl Into<String>) -> bool {
        let content = content.into();
        let Some(path) = self.active.clone() else {
            tracing::debug!("edit with no active file ignored");
            return false;
        };
        if self.last_known.get(&path) == Some(&content) {
            return false;
        }
        self.last_known.insert(path.clone(), content.clone());
        // No subscribers is fine.
        let _ = self.changes.send(ContentChange {
            path: path.clone(),
            content: content.clone(),
        });
        self.writer.push(PendingWrite { path, content });
        true
    }

    /// Apply any pending write now.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Flush and close. Dropping without `dispose` discards a pending write.
    pub async fn dispose(self) {
        self.writer.flush().await;
        tracing::debug!(sandbox_id = %self.lease.sandbox_id(), "editor session disposed");
    }
}
