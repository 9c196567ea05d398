use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::editor::EditorConfig;
use crate::sandbox::{LocalHostConfig, SandboxRuntimeConfig};
use crate::terminal::TerminalConfig;

const ENV_KEYS: &[&str] = &[
    "PLAYBOX_CACHE_TTL_SECS",
    "PLAYBOX_CACHE_CAPACITY",
    "PLAYBOX_WRITE_DEBOUNCE_MS",
    "PLAYBOX_RESIZE_DEBOUNCE_MS",
    "PLAYBOX_SHARE_MAX_ATTEMPTS",
    "PLAYBOX_REGISTRY_URL",
    "PLAYBOX_BACKEND",
    "PLAYBOX_SANDBOX_ROOT",
    "PLAYBOX_STORE_PATH",
    "PLAYBOX_INSTALL_COMMAND",
    "SENTRY_DSN",
    "ENVIRONMENT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub write_debounce: Duration,
    pub resize_debounce: Duration,
    pub share_max_attempts: usize,
    pub registry_url: String,
    pub backend: Backend,
    pub sandbox_root: PathBuf,
    pub store_path: PathBuf,
    pub install_command: String,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

impl Config {
    /// Read from the process environment. Call `dotenvy::dotenv()` first
    /// to pick up a `.env` file.
    pub fn from_env() -> Self {
        let values = ENV_KEYS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
            .collect();
        Self::from_raw_values(&values)
    }

    /// Build from raw key/value pairs. Missing, empty, or unparseable
    /// values fall back to defaults.
    pub fn from_raw_values(values: &HashMap<String, String>) -> Self {
        let get = |key: &str| values.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| -> u64 {
            match get(key).map(str::parse::<u64>) {
                Some(Ok(n)) => n,
                Some(Err(_)) => {
                    tracing::warn!(key, "invalid number in config, using default {default}");
                    default
                }
                None => default,
            }
        };

        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".playbox");

        let backend = match get("PLAYBOX_BACKEND") {
            Some("memory") => Backend::Memory,
            Some("local") | None => Backend::Local,
            Some(other) => {
                tracing::warn!(backend = other, "unknown sandbox backend, using local");
                Backend::Local
            }
        };

        Self {
            cache_ttl: Duration::from_secs(number("PLAYBOX_CACHE_TTL_SECS", 300)),
            cache_capacity: number("PLAYBOX_CACHE_CAPACITY", 8).max(1) as usize,
            write_debounce: Duration::from_millis(number("PLAYBOX_WRITE_DEBOUNCE_MS", 1000)),
            resize_debounce: Duration::from_millis(number("PLAYBOX_RESIZE_DEBOUNCE_MS", 250)),
            share_max_attempts: number("PLAYBOX_SHARE_MAX_ATTEMPTS", 5).max(1) as usize,
            registry_url: get("PLAYBOX_REGISTRY_URL")
                .unwrap_or("https://cdn.jsdelivr.net/npm")
                .to_string(),
            backend,
            sandbox_root: get("PLAYBOX_SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("sandboxes")),
            store_path: get("PLAYBOX_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| base_dir.join("shares.db")),
            install_command: get("PLAYBOX_INSTALL_COMMAND")
                .unwrap_or("npm install")
                .to_string(),
            sentry_dsn: get("SENTRY_DSN").map(str::to_string),
            environment: get("ENVIRONMENT").unwrap_or("local").to_string(),
        }
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            ttl: self.cache_ttl,
            capacity: self.cache_capacity,
        }
    }

    pub fn editor(&self) -> EditorConfig {
        EditorConfig {
            write_debounce: self.write_debounce,
        }
    }

    pub fn terminal(&self) -> TerminalConfig {
        TerminalConfig {
            resize_debounce: self.resize_debounce,
            install_command: self.install_command.clone(),
            ..TerminalConfig::default()
        }
    }

    pub fn sandbox(&self) -> SandboxRuntimeConfig {
        match self.backend {
            Backend::Memory => SandboxRuntimeConfig::Memory,
            Backend::Local => SandboxRuntimeConfig::LocalHost(LocalHostConfig {
                root_dir: self.sandbox_root.clone(),
                ..LocalHostConfig::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_raw_values(&values)
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.cache_ttl, Duration::from_secs(300));
        assert_eq!(c.cache_capacity, 8);
        assert_eq!(c.write_debounce, Duration::from_millis(1000));
        assert_eq!(c.resize_debounce, Duration::from_millis(250));
        assert_eq!(c.share_max_attempts, 5);
        assert_eq!(c.registry_url, "https://cdn.jsdelivr.net/npm");
        assert_eq!(c.backend, Backend::Local);
        assert!(c.sandbox_root.ends_with(".playbox/sandboxes"));
        assert!(c.store_path.ends_with(".playbox/shares.db"));
        assert_eq!(c.install_command, "npm install");
        assert!(c.sentry_dsn.is_none());
        assert_eq!(c.environment, "local");
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("PLAYBOX_CACHE_TTL_SECS", "5"),
            ("PLAYBOX_CACHE_CAPACITY", "2"),
            ("PLAYBOX_WRITE_DEBOUNCE_MS", "300"),
            ("PLAYBOX_BACKEND", "memory"),
            ("PLAYBOX_STORE_PATH", "/tmp/s.db"),
            ("PLAYBOX_INSTALL_COMMAND", "pnpm i"),
            ("SENTRY_DSN", "https://key@sentry.example/1"),
            ("ENVIRONMENT", "production"),
        ]);
        assert_eq!(c.cache().ttl, Duration::from_secs(5));
        assert_eq!(c.cache().capacity, 2);
        assert_eq!(c.editor().write_debounce, Duration::from_millis(300));
        assert!(matches!(c.sandbox(), SandboxRuntimeConfig::Memory));
        assert_eq!(c.store_path, PathBuf::from("/tmp/s.db"));
        assert_eq!(c.terminal().install_command, "pnpm i");
        assert_eq!(c.sentry_dsn.as_deref(), Some("https://key@sentry.example/1"));
        assert_eq!(c.environment, "production");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let c = config(&[
            ("PLAYBOX_CACHE_TTL_SECS", "soon"),
            ("PLAYBOX_CACHE_CAPACITY", "0"),
            ("PLAYBOX_BACKEND", "firecracker"),
            ("SENTRY_DSN", "  "),
        ]);
        assert_eq!(c.cache_ttl, Duration::from_secs(300));
        assert_eq!(c.cache_capacity, 1);
        assert_eq!(c.backend, Backend::Local);
        assert!(c.sentry_dsn.is_none());
    }

    #[test]
    fn test_local_backend_uses_sandbox_root() {
        let c = config(&[("PLAYBOX_SANDBOX_ROOT", "/srv/boxes")]);
        match c.sandbox() {
            SandboxRuntimeConfig::LocalHost(local) => {
                assert_eq!(local.root_dir, PathBuf::from("/srv/boxes"))
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }
}
