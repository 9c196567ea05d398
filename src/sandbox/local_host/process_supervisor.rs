use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::{ShellProcess, ShellSession};
use crate::sandbox::types::ShellRequest;

/// Spawns PTY shells with env filtering and remembers them so that an
/// unmount can kill the whole process tree. Used by `LocalHostProvider`.
pub struct ShellSupervisor {
    shell: String,
    /// Environment variables to inherit from host (allowlist).
    env_allowlist: Vec<String>,
    children: Mutex<Vec<Arc<PtyShell>>>,
}

impl ShellSupervisor {
    pub fn new(shell: String, env_allowlist: Vec<String>) -> Self {
        Self {
            shell,
            env_allowlist,
            children: Mutex::new(Vec::new()),
        }
    }

    /// Only allowlisted host vars plus request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    pub fn spawn(&self, req: &ShellRequest, cwd: &Path) -> Result<ShellSession, SandboxError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: req.rows,
                cols: req.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::Spawn(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(cwd);
        cmd.env_clear();
        for (k, v) in self.build_env(&req.env) {
            cmd.env(k, v);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SandboxError::Spawn(format!("{}: {e}", self.shell)))?;
        // Reader sees EOF only once every slave handle is closed.
        drop(pair.slave);

        // Writer can only be taken once.
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SandboxError::Spawn(format!("pty writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SandboxError::Spawn(format!("pty reader: {e}")))?;

        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let pid = child.process_id();
        let shell = Arc::new(PtyShell {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            writer: Mutex::new(writer),
            pid,
        });
        tracing::info!(pid = ?pid, shell = %self.shell, cwd = %cwd.display(), "spawned PTY shell");

        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(shell.clone());

        Ok(ShellSession {
            process: shell,
            output: output_rx,
        })
    }

    /// Kill every shell this supervisor has spawned.
    pub async fn kill_all(&self) {
        let children: Vec<_> = self
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for child in children {
            child.kill().await;
        }
    }
}

/// A shell attached to a PTY master.
pub struct PtyShell {
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    writer: Mutex<Box<dyn Write + Send>>,
    pid: Option<u32>,
}

#[async_trait]
impl ShellProcess for PtyShell {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write_stdin(&self, data: &[u8]) -> Result<(), SandboxError> {
        let mut w = self
            .writer
            .lock()
            .map_err(|_| SandboxError::Spawn("pty writer poisoned".into()))?;
        w.write_all(data)?;
        w.flush()?;
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let master = self
            .master
            .lock()
            .map_err(|_| SandboxError::Spawn("pty master poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::Spawn(format!("pty resize: {e}")))
    }

    async fn kill(&self) {
        let mut child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = child.kill() {
            // ESRCH is expected if the child already exited
            tracing::trace!(pid = ?self.pid, error = %e, "PTY child kill");
        } else {
            tracing::info!(pid = ?self.pid, "killed PTY shell");
        }
    }
}

impl Drop for PtyShell {
    fn drop(&mut self) {
        if let Ok(child) = self.child.get_mut() {
            let _ = child.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn supervisor() -> ShellSupervisor {
        ShellSupervisor::new("/bin/sh".into(), vec!["PATH".into()])
    }

    async fn read_until(session: &mut ShellSession, needle: &str) -> bool {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), session.output.recv()).await {
                Ok(Some(chunk)) => {
                    seen.push_str(&String::from_utf8_lossy(&chunk));
                    if seen.contains(needle) {
                        return true;
                    }
                }
                Ok(None) => return seen.contains(needle),
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn shell_echoes_through_pty() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let mut session = sup.spawn(&ShellRequest::default(), tmp.path()).unwrap();
        session
            .process
            .write_stdin(b"echo pty-$((40+2))\n")
            .await
            .unwrap();
        assert!(read_until(&mut session, "pty-42").await);
        sup.kill_all().await;
    }

    #[tokio::test]
    async fn env_is_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let mut req = ShellRequest::default();
        req.env.insert("MY_VAR".into(), "my_value".into());
        let mut session = sup.spawn(&req, tmp.path()).unwrap();
        session
            .process
            .write_stdin(b"echo got-$MY_VAR\n")
            .await
            .unwrap();
        assert!(read_until(&mut session, "got-my_value").await);
        sup.kill_all().await;
    }

    #[tokio::test]
    async fn kill_twice_does_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let session = sup.spawn(&ShellRequest::default(), tmp.path()).unwrap();
        session.process.kill().await;
        session.process.kill().await;
    }

    #[tokio::test]
    async fn missing_shell_fails_to_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = ShellSupervisor::new("/definitely/not/a/shell".into(), vec![]);
        assert!(matches!(
            sup.spawn(&ShellRequest::default(), tmp.path()),
            Err(SandboxError::Spawn(_))
        ));
    }
}
