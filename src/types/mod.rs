//! Automatic type acquisition.
//!
//! Watches editor content for imports, fetches declaration files for the
//! imported packages, installs them into the editor's type environment,
//! and follows whatever those declarations reference in turn.

pub mod imports;
pub mod registry;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;

use crate::debounce::Debouncer;
use crate::editor::ContentChange;
use imports::Reference;

pub use registry::HttpDeclarationRegistry;

/// Prefix under which declarations are installed.
pub const SYNTHETIC_ROOT: &str = "file:///node_modules/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub code: String,
    /// Registry-relative path, e.g. `react/index.d.ts`.
    pub resolved_path: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(String),

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("decode error: {0}")]
    Decode(String),
}

/// Source of `.d.ts` files.
#[async_trait]
pub trait DeclarationRegistry: Send + Sync {
    /// Entry declaration for a package. `Ok(None)` if it has none.
    async fn fetch(&self, specifier: &str) -> Result<Option<Declaration>, FetchError>;

    /// A specific declaration file by registry-relative path.
    async fn fetch_path(&self, resolved_path: &str) -> Result<Option<Declaration>, FetchError>;
}

/// The static-analysis environment declarations are installed into.
pub trait TypeEnvironment: Send + Sync {
    fn add_extra_lib(&self, path: &str, code: &str);
}

/// Type environment that just keeps what it is given.
#[derive(Default)]
pub struct InMemoryTypeEnvironment {
    libs: RwLock<BTreeMap<String, String>>,
}

impl InMemoryTypeEnvironment {
    pub fn libs(&self) -> BTreeMap<String, String> {
        self.libs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.libs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(path)
    }
}

impl TypeEnvironment for InMemoryTypeEnvironment {
    fn add_extra_lib(&self, path: &str, code: &str) {
        self.libs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), code.to_string());
    }
}

/// Outcome recorded for a specifier or declaration path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Installed { resolved_path: String },
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Package(String),
    Path(String),
}

struct Resolved {
    resolution: Resolution,
    references: Vec<Key>,
}

pub struct TypeAcquisition {
    registry: Arc<dyn DeclarationRegistry>,
    environment: Arc<dyn TypeEnvironment>,
    seen: Mutex<HashMap<Key, Arc<OnceCell<Arc<Resolved>>>>>,
}

impl TypeAcquisition {
    pub fn new(registry: Arc<dyn DeclarationRegistry>, environment: Arc<dyn TypeEnvironment>) -> Self {
        Self {
            registry,
            environment,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch types for every package `source` imports.
    pub async fn acquire_for_source(&self, source: &str) {
        let packages = imports::package_imports(source);
        self.acquire_all(packages.into_iter().map(Key::Package).collect())
            .await;
    }

    /// Fetch types for a declared dependency map, e.g. from `package.json`.
    pub async fn acquire_dependencies(&self, deps: &BTreeMap<String, String>) {
        let keys = deps
            .keys()
            .filter(|name| imports::is_package(name))
            .map(|name| Key::Package(imports::package_root(name).to_string()))
            .collect();
        self.acquire_all(keys).await;
    }

    /// What happened to `specifier`, if it was ever requested.
    pub fn status(&self, specifier: &str) -> Option<Resolution> {
        let cell = self.lock().get(&Key::Package(specifier.to_string())).cloned()?;
        cell.get().map(|r| r.resolution.clone())
    }

    /// Run acquisition on an editor content stream, debounced by `window`.
    /// Dropping the returned task stops it.
    pub fn watch(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<ContentChange>,
        window: Duration,
    ) -> AcquisitionTask {
        let this = self.clone();
        let task = tokio::spawn(async move {
            let debouncer = Debouncer::spawn(window, move |content: String| {
                let this = this.clone();
                async move { this.acquire_for_source(&content).await }
            });
            loop {
                match changes.recv().await {
                    Ok(change) => debouncer.push(change.content),
                    // Only the latest content matters.
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "type acquisition lagged behind editor");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debouncer.flush().await;
                        break;
                    }
                }
            }
        });
        AcquisitionTask { task }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Key, Arc<OnceCell<Arc<Resolved>>>>> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire_all(&self, keys: Vec<Key>) {
        join_all(keys.into_iter().map(|key| self.acquire(key))).await;
    }

    fn acquire(&self, key: Key) -> BoxFuture<'_, ()> {
        async move {
            let cell = self.lock().entry(key.clone()).or_default().clone();
            let fresh = AtomicBool::new(false);
            let resolved = cell
                .get_or_init(|| async {
                    fresh.store(true, Ordering::SeqCst);
                    Arc::new(self.resolve(&key).await)
                })
                .await
                .clone();
            if !fresh.load(Ordering::SeqCst) {
                return;
            }
            // A package entry is also reachable by its resolved path.
            if let (Key::Package(_), Resolution::Installed { resolved_path }) = (&key, &resolved.resolution) {
                self.lock()
                    .entry(Key::Path(resolved_path.clone()))
                    .or_insert_with(|| cell.clone());
            }
            // Only whoever installed a declaration follows its references,
            // and only after its cell is filled, so cycles terminate.
            if !resolved.references.is_empty() {
                self.acquire_all(resolved.references.clone()).await;
            }
        }
        .boxed()
    }

    async fn resolve(&self, key: &Key) -> Resolved {
        let fetched = match key {
            Key::Package(name) => self.registry.fetch(name).await,
            Key::Path(path) => self.registry.fetch_path(path).await,
        };
        match fetched {
            Ok(Some(decl)) => {
                let path = format!("{SYNTHETIC_ROOT}{}", decl.resolved_path);
                self.environment.add_extra_lib(&path, &decl.code);
                tracing::debug!(?key, path = %path, "installed declaration");
                let references = imports::declaration_references(&decl.code)
                    .into_iter()
                    .map(|r| match r {
                        Reference::Package(name) => Key::Package(name),
                        Reference::Relative(rel) => {
                            Key::Path(imports::resolve_relative(&decl.resolved_path, &rel))
                        }
                    })
                    .collect();
                Resolved {
                    resolution: Resolution::Installed {
                        resolved_path: decl.resolved_path,
                    },
                    references,
                }
            }
            Ok(None) => {
                tracing::debug!(?key, "no declarations found");
                Resolved {
                    resolution: Resolution::NotFound,
                    references: Vec::new(),
                }
            }
            Err(e) => {
                tracing::warn!(?key, error = %e, "declaration fetch failed");
                Resolved {
                    resolution: Resolution::Failed(e.to_string()),
                    references: Vec::new(),
                }
            }
        }
    }
}

/// Background acquisition bound to an editor; aborted on drop.
pub struct AcquisitionTask {
    task: JoinHandle<()>,
}

impl AcquisitionTask {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AcquisitionTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeRegistry {
        packages: HashMap<String, Declaration>,
        files: HashMap<String, String>,
        failing: Vec<String>,
        calls: Mutex<Vec<String>>,
        fetches: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FakeRegistry {
        fn package(mut self, name: &str, path: &str, code: &str) -> Self {
            self.packages.insert(
                name.into(),
                Declaration {
                    code: code.into(),
                    resolved_path: path.into(),
                },
            );
            self
        }

        fn file(mut self, path: &str, code: &str) -> Self {
            self.files.insert(path.into(), code.into());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeclarationRegistry for FakeRegistry {
        async fn fetch(&self, specifier: &str) -> Result<Option<Declaration>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(specifier.to_string());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.iter().any(|f| f == specifier) {
                return Err(FetchError::Status {
                    url: specifier.into(),
                    status: 500,
                });
            }
            Ok(self.packages.get(specifier).cloned())
        }

        async fn fetch_path(&self, resolved_path: &str) -> Result<Option<Declaration>, FetchError> {
            self.calls.lock().unwrap().push(resolved_path.to_string());
            Ok(self.files.get(resolved_path).map(|code| Declaration {
                code: code.clone(),
                resolved_path: resolved_path.into(),
            }))
        }
    }

    fn setup(registry: FakeRegistry) -> (Arc<FakeRegistry>, Arc<InMemoryTypeEnvironment>, Arc<TypeAcquisition>) {
        let registry = Arc::new(registry);
        let env = Arc::new(InMemoryTypeEnvironment::default());
        let ata = Arc::new(TypeAcquisition::new(registry.clone(), env.clone()));
        (registry, env, ata)
    }

    #[tokio::test]
    async fn installs_imported_packages_at_synthetic_paths() {
        let (_registry, env, ata) = setup(
            FakeRegistry::default().package("lodash", "@types/lodash/index.d.ts", "export declare const x: number;"),
        );
        ata.acquire_for_source("import _ from 'lodash/fp'; import './local';").await;

        assert!(env.contains("file:///node_modules/@types/lodash/index.d.ts"));
        assert_eq!(
            ata.status("lodash"),
            Some(Resolution::Installed {
                resolved_path: "@types/lodash/index.d.ts".into()
            })
        );
    }

    #[tokio::test]
    async fn follows_references_and_terminates_on_cycles() {
        let (registry, env, ata) = setup(
            FakeRegistry::default()
                .package(
                    "react",
                    "@types/react/index.d.ts",
                    "/// <reference path=\"global.d.ts\" />\nimport * as CSS from 'csstype';\nexport * from './jsx';",
                )
                .package("csstype", "csstype/index.d.ts", "import 'react';")
                .file("@types/react/global.d.ts", "declare var g: 1;")
                .file("@types/react/jsx.d.ts", "export * from './index';")
                .file("@types/react/index.d.ts", "declare const stale: 1;"),
        );
        ata.acquire_for_source("import React from 'react';").await;

        let libs = env.libs();
        for path in [
            "file:///node_modules/@types/react/index.d.ts",
            "file:///node_modules/@types/react/global.d.ts",
            "file:///node_modules/@types/react/jsx.d.ts",
            "file:///node_modules/csstype/index.d.ts",
        ] {
            assert!(libs.contains_key(path), "missing {path}");
        }
        let react_fetches = registry.calls().iter().filter(|c| *c == "react").count();
        assert_eq!(react_fetches, 1);
        // `./index` from jsx.d.ts is react's own entry, already installed.
        assert!(!registry.calls().iter().any(|c| c == "@types/react/index.d.ts"));
        assert!(libs["file:///node_modules/@types/react/index.d.ts"].starts_with("/// <reference"));
    }

    #[tokio::test]
    async fn known_specifiers_are_not_refetched() {
        let (registry, _env, ata) = setup(FakeRegistry {
            failing: vec!["broken".into()],
            ..FakeRegistry::default()
        }
        .package("vue", "vue/index.d.ts", ""));

        let src = "import 'vue'; import 'missing'; import 'broken';";
        ata.acquire_for_source(src).await;
        ata.acquire_for_source(src).await;

        assert_eq!(registry.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(ata.status("missing"), Some(Resolution::NotFound));
        assert!(matches!(ata.status("broken"), Some(Resolution::Failed(_))));
        assert!(matches!(ata.status("vue"), Some(Resolution::Installed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let (registry, _env, ata) = setup(FakeRegistry {
            delay: Some(Duration::from_millis(50)),
            ..FakeRegistry::default()
        }
        .package("zod", "zod/index.d.ts", ""));

        let src = "import { z } from 'zod';";
        tokio::join!(ata.acquire_for_source(src), ata.acquire_for_source(src));
        assert_eq!(registry.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dependency_map_is_acquired_eagerly() {
        let (_registry, env, ata) = setup(
            FakeRegistry::default()
                .package("react", "@types/react/index.d.ts", "")
                .package("@scope/ui", "@scope/ui/dist/index.d.ts", ""),
        );
        let deps = BTreeMap::from([
            ("react".to_string(), "^18".to_string()),
            ("@scope/ui".to_string(), "1.0.0".to_string()),
        ]);
        ata.acquire_dependencies(&deps).await;
        assert_eq!(env.libs().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_debounces_editor_stream() {
        let (registry, env, ata) = setup(
            FakeRegistry::default()
                .package("a", "a/index.d.ts", "")
                .package("b", "b/index.d.ts", ""),
        );
        let (tx, rx) = broadcast::channel(16);
        let task = ata.watch(rx, Duration::from_millis(300));

        for content in ["import 'a'", "import 'b'"] {
            tx.send(ContentChange {
                path: "index.ts".into(),
                content: content.into(),
            })
            .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(registry.calls(), vec!["b"]);
        assert!(env.contains("file:///node_modules/b/index.d.ts"));

        drop(task);
        tx.send(ContentChange {
            path: "index.ts".into(),
            content: "import 'a'".into(),
        })
        .ok();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(registry.calls(), vec!["b"]);
    }
}
