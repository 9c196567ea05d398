//! In-process sandbox backend.
//!
//! Files live in a map, shells echo their input back as output. Useful on
//! hosts without PTY support and for exercising the orchestration layer
//! deterministically. Counters expose every lifecycle transition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{SandboxHandle, ShellProcess, ShellSession};
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;
use crate::workspace::{normalize_path, Workspace};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub boots: usize,
    pub mounts: usize,
    pub unmounts: usize,
    pub writes: usize,
    pub shells_spawned: usize,
    pub shells_killed: usize,
}

#[derive(Default)]
struct Counters {
    boots: AtomicUsize,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    writes: AtomicUsize,
    shells_spawned: AtomicUsize,
    shells_killed: AtomicUsize,
}

#[derive(Default)]
struct Faults {
    boot: Option<String>,
    mounts: usize,
    writes: usize,
}

pub struct MemoryProvider {
    counters: Arc<Counters>,
    faults: Arc<Mutex<Faults>>,
    mount_delay: Duration,
    shells: Arc<Mutex<Vec<Arc<MemoryShell>>>>,
    next_pid: Arc<AtomicU32>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            faults: Arc::new(Mutex::new(Faults::default())),
            mount_delay: Duration::ZERO,
            shells: Arc::new(Mutex::new(Vec::new())),
            next_pid: Arc::new(AtomicU32::new(1000)),
        }
    }

    /// Simulate a slow mount so concurrent callers overlap.
    pub fn with_mount_delay(mut self, delay: Duration) -> Self {
        self.mount_delay = delay;
        self
    }

    /// Make every boot fail as if the host lacked isolation support.
    pub fn fail_boot(&self, reason: impl Into<String>) {
        self.faults().boot = Some(reason.into());
    }

    /// Fail the next `n` mounts.
    pub fn fail_next_mounts(&self, n: usize) {
        self.faults().mounts = n;
    }

    /// Fail the next `n` writes across all handles.
    pub fn fail_next_writes(&self, n: usize) {
        self.faults().writes = n;
    }

    pub fn stats(&self) -> MemoryStats {
        let c = &self.counters;
        MemoryStats {
            boots: c.boots.load(Ordering::SeqCst),
            mounts: c.mounts.load(Ordering::SeqCst),
            unmounts: c.unmounts.load(Ordering::SeqCst),
            writes: c.writes.load(Ordering::SeqCst),
            shells_spawned: c.shells_spawned.load(Ordering::SeqCst),
            shells_killed: c.shells_killed.load(Ordering::SeqCst),
        }
    }

    /// Every shell spawned so far, oldest first.
    pub fn shells(&self) -> Vec<Arc<MemoryShell>> {
        lock(&self.shells).clone()
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        lock(&self.faults)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl SandboxProvider for MemoryProvider {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Memory
    }

    async fn boot(&self) -> Result<String, SandboxError> {
        self.counters.boots.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.faults().boot.clone() {
            return Err(SandboxError::RuntimeUnavailable(reason));
        }
        Ok(format!("memory-{}", uuid::Uuid::new_v4()))
    }

    async fn mount(&self, workspace: &Workspace) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        self.counters.mounts.fetch_add(1, Ordering::SeqCst);
        if !self.mount_delay.is_zero() {
            tokio::time::sleep(self.mount_delay).await;
        }
        {
            let mut faults = self.faults();
            if faults.mounts > 0 {
                faults.mounts -= 1;
                return Err(SandboxError::Mount(format!(
                    "injected mount failure for {}",
                    workspace.name()
                )));
            }
        }

        let files = workspace
            .files()
            .into_iter()
            .map(|e| (e.path.to_string(), e.file.content.clone().into_bytes()))
            .collect();
        let seq = self.counters.mounts.load(Ordering::SeqCst);
        Ok(Box::new(MemoryHandle {
            id: format!("memory-{}-{seq}", workspace.name()),
            files: RwLock::new(files),
            metadata: SandboxMetadata {
                workspace: workspace.name().to_string(),
                mount_root: format!("/workspaces/{}", workspace.name()),
                created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            },
            counters: self.counters.clone(),
            faults: self.faults.clone(),
            provider_shells: self.shells.clone(),
            own_shells: Mutex::new(Vec::new()),
            next_pid: self.next_pid.clone(),
        }))
    }
}

struct MemoryHandle {
    id: String,
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    metadata: SandboxMetadata,
    counters: Arc<Counters>,
    faults: Arc<Mutex<Faults>>,
    provider_shells: Arc<Mutex<Vec<Arc<MemoryShell>>>>,
    own_shells: Mutex<Vec<Arc<MemoryShell>>>,
    next_pid: Arc<AtomicU32>,
}

#[async_trait]
impl SandboxHandle for MemoryHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Memory
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        {
            let mut faults = lock(&self.faults);
            if faults.writes > 0 {
                faults.writes -= 1;
                return Err(SandboxError::Write {
                    path: path.to_string(),
                    reason: "injected write failure".into(),
                });
            }
        }
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        self.files
            .write()
            .await
            .insert(normalize_path(path), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.files
            .read()
            .await
            .get(&normalize_path(path))
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(path.to_string()))
    }

    async fn spawn_shell(&self, req: ShellRequest) -> Result<ShellSession, SandboxError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shell = Arc::new(MemoryShell {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            env: req.env,
            output: Mutex::new(Some(tx)),
            input: Mutex::new(Vec::new()),
            resizes: Mutex::new(vec![(req.cols, req.rows)]),
            counters: self.counters.clone(),
        });
        self.counters.shells_spawned.fetch_add(1, Ordering::SeqCst);
        lock(&self.own_shells).push(shell.clone());
        lock(&self.provider_shells).push(shell.clone());
        Ok(ShellSession {
            process: shell,
            output: rx,
        })
    }

    async fn unmount(&self) -> Result<(), SandboxError> {
        let shells: Vec<_> = lock(&self.own_shells).drain(..).collect();
        for shell in shells {
            shell.kill().await;
        }
        self.files.write().await.clear();
        self.counters.unmounts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(sandbox_id = %self.id, "memory sandbox unmounted");
        Ok(())
    }
}

/// Echo shell: every stdin write is reflected on the output stream.
pub struct MemoryShell {
    pid: u32,
    env: BTreeMap<String, String>,
    output: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    input: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    counters: Arc<Counters>,
}

impl MemoryShell {
    /// Everything written to stdin so far.
    pub fn input(&self) -> String {
        String::from_utf8_lossy(&lock(&self.input)).to_string()
    }

    /// Terminal sizes in the order they were applied, starting with the
    /// spawn size.
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.resizes).clone()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn is_killed(&self) -> bool {
        lock(&self.output).is_none()
    }

    /// Push bytes onto the output stream as if the process printed them.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = lock(&self.output).as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }
}

#[async_trait]
impl ShellProcess for MemoryShell {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<(), SandboxError> {
        if self.is_killed() {
            return Err(SandboxError::Spawn(format!("process {} has exited", self.pid)));
        }
        lock(&self.input).extend_from_slice(data);
        self.emit(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        lock(&self.resizes).push((cols, rows));
        Ok(())
    }

    async fn kill(&self) {
        if lock(&self.output).take().is_some() {
            self.counters.shells_killed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
