pub mod backends;
pub mod client;
pub mod error;
pub mod handle;
pub mod local_host;
pub mod provider;
pub mod types;

use std::sync::Arc;

pub use client::SandboxRuntimeClient;
pub use error::SandboxError;
pub use handle::{SandboxHandle, ShellProcess, ShellSession};
pub use provider::SandboxProvider;
pub use types::*;

use backends::local::LocalHostProvider;
use backends::memory::MemoryProvider;

/// Build a sandbox provider from runtime config.
pub fn build_provider(config: SandboxRuntimeConfig) -> Arc<dyn SandboxProvider> {
    match config {
        SandboxRuntimeConfig::LocalHost(c) => {
            tracing::info!(
                root_dir = %c.root_dir.display(),
                shell = %c.shell,
                "initializing local-host sandbox provider"
            );
            Arc::new(LocalHostProvider::new(c))
        }
        SandboxRuntimeConfig::Memory => {
            tracing::info!("initializing in-memory sandbox provider");
            Arc::new(MemoryProvider::new())
        }
    }
}
