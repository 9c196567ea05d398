use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::WorkspaceLease;
use crate::debounce::Debouncer;
use crate::sandbox::{SandboxError, ShellProcess, ShellRequest};
use crate::workspace::Workspace;

/// Where shell output ends up, e.g. an xterm widget or the CLI's stdout.
pub trait TerminalSurface: Send + Sync {
    fn write(&self, bytes: &[u8]);
}

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub resize_debounce: Duration,
    /// Prepended to the startup command when the workspace declares
    /// dependencies.
    pub install_command: String,
    pub cols: u16,
    pub rows: u16,
    pub env: BTreeMap<String, String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            resize_debounce: Duration::from_millis(250),
            install_command: "npm install".into(),
            cols: 80,
            rows: 24,
            env: BTreeMap::new(),
        }
    }
}

struct AttachedShell {
    process: Arc<dyn ShellProcess>,
    pump: JoinHandle<()>,
}

/// Shells attached to a leased sandbox, with output pumped to a surface.
pub struct TerminalChannel {
    lease: WorkspaceLease,
    shells: Vec<AttachedShell>,
    resizer: Debouncer<(u16, u16)>,
}

impl TerminalChannel {
    /// Spawn one shell per startup command the workspace declares (one
    /// plain shell if it declares none) and send each its startup line.
    pub async fn attach(
        lease: &WorkspaceLease,
        workspace: &Workspace,
        surface: Arc<dyn TerminalSurface>,
        config: TerminalConfig,
    ) -> Result<Self, SandboxError> {
        let install = if workspace.dependencies().is_empty() {
            None
        } else {
            Some(config.install_command.as_str())
        };
        let commands: Vec<Option<&str>> = if workspace.shells().is_empty() {
            vec![None]
        } else {
            workspace.shells().iter().map(|s| Some(s.as_str())).collect()
        };

        let mut shells = Vec::with_capacity(commands.len());
        for command in commands {
            let session = lease
                .handle()
                .spawn_shell(ShellRequest {
                    env: config.env.clone(),
                    cols: config.cols,
                    rows: config.rows,
                })
                .await;
            let session = match session {
                Ok(session) => session,
                Err(e) => {
                    kill_all(shells).await;
                    return Err(e);
                }
            };

            let mut output = session.output;
            let sink = surface.clone();
            let pump = tokio::spawn(async move {
                while let Some(chunk) = output.recv().await {
                    sink.write(&chunk);
                }
            });

            let line = startup_line(lease.mount_root(), install, command);
            tracing::info!(
                sandbox_id = %lease.sandbox_id(),
                pid = ?session.process.pid(),
                startup = %line,
                "terminal shell attached"
            );
            let process = session.process;
            shells.push(AttachedShell {
                process: process.clone(),
                pump,
            });
            if let Err(e) = process.write_stdin(format!("{line}\n").as_bytes()).await {
                kill_all(shells).await;
                return Err(e);
            }
        }

        let targets: Vec<_> = shells.iter().map(|s| s.process.clone()).collect();
        let resizer = Debouncer::spawn(config.resize_debounce, move |(cols, rows): (u16, u16)| {
            let targets = targets.clone();
            async move {
                for process in &targets {
                    if let Err(e) = process.resize(cols, rows).await {
                        tracing::warn!(pid = ?process.pid(), error = %e, "terminal resize failed");
                    }
                }
            }
        });

        Ok(Self {
            lease: lease.clone(),
            shells,
            resizer,
        })
    }

    pub fn shell_count(&self) -> usize {
        self.shells.len()
    }

    /// Send keystrokes to the first shell.
    pub async fn send_input(&self, bytes: &[u8]) -> Result<(), SandboxError> {
        self.send_input_to(0, bytes).await
    }

    pub async fn send_input_to(&self, index: usize, bytes: &[u8]) -> Result<(), SandboxError> {
        let shell = self
            .shells
            .get(index)
            .ok_or_else(|| SandboxError::NotFound(format!("shell #{index}")))?;
        shell.process.write_stdin(bytes).await
    }

    /// Debounced; only the last size in a burst reaches the shells.
    pub fn resize(&self, cols: u16, rows: u16) {
        self.resizer.push((cols, rows));
    }

    /// Stop pumping output and kill every shell.
    pub async fn dispose(mut self) {
        let shells = std::mem::take(&mut self.shells);
        tracing::debug!(
            sandbox_id = %self.lease.sandbox_id(),
            shells = shells.len(),
            "terminal disposed"
        );
        kill_all(shells).await;
    }
}

impl Drop for TerminalChannel {
    fn drop(&mut self) {
        let shells = std::mem::take(&mut self.shells);
        if shells.is_empty() {
            return;
        }
        for shell in &shells {
            shell.pump.abort();
        }
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(kill_all(shells));
        }
    }
}

async fn kill_all(shells: Vec<AttachedShell>) {
    for shell in shells {
        shell.pump.abort();
        shell.process.kill().await;
    }
}

fn startup_line(mount_root: &str, install: Option<&str>, command: Option<&str>) -> String {
    let mut parts = vec![format!("cd {}", shell_quote(mount_root))];
    parts.extend(install.map(str::to_string));
    parts.extend(command.filter(|c| !c.trim().is_empty()).map(str::to_string));
    parts.join(" && ")
}

fn shell_quote(s: &str) -> String {
    let plain = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if plain && !s.is_empty() {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
