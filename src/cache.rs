//! Bounded, idle-TTL registry of mounted sandboxes keyed by workspace name.
//!
//! `get` hands out `WorkspaceLease`s. While any lease for an entry is alive
//! the entry is pinned; once the last lease drops, the idle timer starts and
//! the sandbox is torn down when it fires. Concurrent misses for the same
//! name share one boot/mount.
//!
//! Keys are workspace *names*: two different trees under one name share a
//! sandbox. Callers wanting isolation must pick a fresh name.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sandbox::{SandboxError, SandboxHandle, SandboxRuntimeClient};
use crate::workspace::Workspace;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Idle time after the last lease drops before teardown.
    pub ttl: Duration,
    /// Maximum live entries before idle ones are evicted early.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 8,
        }
    }
}

/// A workspace mounted into a live sandbox. Owned by the cache.
pub struct MountedWorkspace {
    workspace: Workspace,
    handle: Box<dyn SandboxHandle>,
    structure_hash: u64,
}

impl MountedWorkspace {
    /// The tree as it was when mounted.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn handle(&self) -> &dyn SandboxHandle {
        self.handle.as_ref()
    }

    pub fn sandbox_id(&self) -> &str {
        self.handle.id()
    }

    pub fn mount_root(&self) -> &str {
        &self.handle.metadata().mount_root
    }
}

type MountResult = Result<Arc<MountedWorkspace>, SandboxError>;
type MountFuture = Shared<BoxFuture<'static, MountResult>>;

enum Slot {
    Pending(MountFuture),
    Ready(Arc<MountedWorkspace>),
}

struct Entry {
    slot: Slot,
    refs: usize,
    last_used: Instant,
    generation: u64,
    /// Bumped whenever the idle timer is (re)armed or cancelled, so a timer
    /// that already woke up can tell it was superseded.
    idle_epoch: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn cancel_idle(&mut self) {
        self.idle_epoch += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    client: Arc<SandboxRuntimeClient>,
    config: CacheConfig,
    entries: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct WorkspaceCache {
    inner: Arc<Inner>,
}

impl WorkspaceCache {
    pub fn new(client: Arc<SandboxRuntimeClient>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn client(&self) -> &Arc<SandboxRuntimeClient> {
        &self.inner.client
    }

    /// Lease the sandbox for `workspace`, booting and mounting on a miss.
    ///
    /// Errors are delivered to every caller waiting on the same mount and
    /// are not cached; the next `get` starts over.
    pub async fn get(&self, workspace: &Workspace) -> Result<WorkspaceLease, SandboxError> {
        let name = workspace.name().to_string();
        let mut victims = Vec::new();

        let (pending, guard) = {
            let mut entries = self.inner.lock();
            match entries.get_mut(&name) {
                Some(entry) => {
                    entry.refs += 1;
                    entry.last_used = Instant::now();
                    entry.cancel_idle();
                    let guard = RefGuard {
                        cache: Arc::downgrade(&self.inner),
                        name: name.clone(),
                        generation: entry.generation,
                    };
                    match &entry.slot {
                        Slot::Ready(mounted) => {
                            if mounted.structure_hash != workspace.structure_hash() {
                                tracing::debug!(
                                    workspace = %name,
                                    "cache hit with a different tree shape; reusing existing sandbox"
                                );
                            }
                            tracing::debug!(workspace = %name, refs = entry.refs, "workspace cache hit");
                            return Ok(WorkspaceLease {
                                mounted: mounted.clone(),
                                _guard: guard,
                            });
                        }
                        Slot::Pending(fut) => {
                            tracing::debug!(workspace = %name, "joining in-flight mount");
                            (fut.clone(), guard)
                        }
                    }
                }
                None => {
                    victims = self.inner.make_room(&mut entries);
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
                    let fut = spawn_mount(&self.inner, workspace.clone(), generation);
                    entries.insert(
                        name.clone(),
                        Entry {
                            slot: Slot::Pending(fut.clone()),
                            refs: 1,
                            last_used: Instant::now(),
                            generation,
                            idle_epoch: 0,
                            idle_timer: None,
                        },
                    );
                    tracing::info!(workspace = %name, generation, "workspace cache miss");
                    let guard = RefGuard {
                        cache: Arc::downgrade(&self.inner),
                        name: name.clone(),
                        generation,
                    };
                    (fut, guard)
                }
            }
        };

        for victim in victims {
            tokio::spawn(teardown(victim));
        }

        let mounted = pending.await?;
        Ok(WorkspaceLease {
            mounted,
            _guard: guard,
        })
    }

    /// Tear down `name` now, regardless of outstanding leases.
    pub async fn evict(&self, name: &str) -> bool {
        let removed = self.inner.lock().remove(name);
        match removed {
            Some(mut entry) => {
                entry.cancel_idle();
                tracing::info!(workspace = %name, "evicting workspace");
                if let Slot::Ready(mounted) = entry.slot {
                    teardown(mounted).await;
                }
                true
            }
            None => false,
        }
    }

    /// Tear down every cached sandbox.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Entry)> = self.inner.lock().drain().collect();
        for (name, mut entry) in drained {
            entry.cancel_idle();
            if let Slot::Ready(mounted) = entry.slot {
                tracing::info!(workspace = %name, "shutting down workspace");
                teardown(mounted).await;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().contains_key(name)
    }

    /// Outstanding lease count for `name` (including in-flight callers).
    pub fn refs(&self, name: &str) -> usize {
        self.inner.lock().get(name).map(|e| e.refs).unwrap_or(0)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Evict least-recently-used idle entries until there is room for one
    /// more. Returns the sandboxes to tear down outside the lock.
    fn make_room(&self, entries: &mut HashMap<String, Entry>) -> Vec<Arc<MountedWorkspace>> {
        let mut victims = Vec::new();
        while entries.len() >= self.config.capacity.max(1) {
            let lru = entries
                .iter()
                .filter(|(_, e)| e.refs == 0 && matches!(e.slot, Slot::Ready(_)))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(name, _)| name.clone());
            let Some(name) = lru else {
                tracing::warn!(
                    capacity = self.config.capacity,
                    live = entries.len(),
                    "workspace cache full of leased entries; growing past capacity"
                );
                break;
            };
            if let Some(mut entry) = entries.remove(&name) {
                entry.cancel_idle();
                tracing::info!(workspace = %name, "evicting least-recently-used workspace");
                if let Slot::Ready(mounted) = entry.slot {
                    victims.push(mounted);
                }
            }
        }
        victims
    }

    fn finish_mount(self: &Arc<Self>, name: &str, generation: u64, result: &MountResult) {
        let mut orphan = None;
        {
            let mut entries = self.lock();
            let current = entries
                .get(name)
                .is_some_and(|e| e.generation == generation);
            match (current, result) {
                (true, Ok(mounted)) => {
                    if let Some(entry) = entries.get_mut(name) {
                        entry.slot = Slot::Ready(mounted.clone());
                        entry.last_used = Instant::now();
                        if entry.refs == 0 {
                            self.arm_idle(name, entry);
                        }
                    }
                    tracing::info!(
                        workspace = %name,
                        sandbox_id = %mounted.sandbox_id(),
                        "workspace mounted"
                    );
                }
                (true, Err(e)) => {
                    entries.remove(name);
                    tracing::warn!(workspace = %name, error = %e, "workspace mount failed");
                }
                // Evicted while mounting.
                (false, Ok(mounted)) => orphan = Some(mounted.clone()),
                (false, Err(_)) => {}
            }
        }
        if let Some(mounted) = orphan {
            tokio::spawn(teardown(mounted));
        }
    }

    fn acquire(&self, name: &str, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(name) {
            Some(entry) if entry.generation == generation => {
                entry.refs += 1;
                entry.last_used = Instant::now();
                entry.cancel_idle();
                true
            }
            _ => false,
        }
    }

    fn release(self: &Arc<Self>, name: &str, generation: u64) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        entry.last_used = Instant::now();
        if entry.refs == 0 && matches!(entry.slot, Slot::Ready(_)) {
            self.arm_idle(name, entry);
        }
    }

    fn arm_idle(self: &Arc<Self>, name: &str, entry: &mut Entry) {
        entry.cancel_idle();
        let epoch = entry.idle_epoch;
        let generation = entry.generation;
        let ttl = self.config.ttl;
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        tracing::debug!(workspace = %name, ttl_ms = ttl.as_millis() as u64, "idle timer armed");
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let expired = inner.take_expired(&name, generation, epoch);
            if let Some(mounted) = expired {
                tracing::info!(workspace = %name, "idle TTL expired; tearing down");
                teardown(mounted).await;
            }
        }));
    }

    fn take_expired(&self, name: &str, generation: u64, epoch: u64) -> Option<Arc<MountedWorkspace>> {
        let mut entries = self.lock();
        let entry = entries.get(name)?;
        if entry.generation != generation || entry.idle_epoch != epoch || entry.refs != 0 {
            return None;
        }
        match entries.remove(name)?.slot {
            Slot::Ready(mounted) => Some(mounted),
            Slot::Pending(_) => None,
        }
    }
}

fn spawn_mount(inner: &Arc<Inner>, workspace: Workspace, generation: u64) -> MountFuture {
    let inner = inner.clone();
    let task = tokio::spawn(async move {
        let name = workspace.name().to_string();
        let result = mount(&inner.client, workspace).await;
        inner.finish_mount(&name, generation, &result);
        result
    });
    async move {
        task.await
            .unwrap_or_else(|e| Err(SandboxError::Mount(format!("mount task failed: {e}"))))
    }
    .boxed()
    .shared()
}

async fn mount(client: &SandboxRuntimeClient, workspace: Workspace) -> MountResult {
    let token = client.boot().await?;
    let handle = client.mount(&token, &workspace).await?;
    let structure_hash = workspace.structure_hash();
    Ok(Arc::new(MountedWorkspace {
        workspace,
        handle,
        structure_hash,
    }))
}

async fn teardown(mounted: Arc<MountedWorkspace>) {
    if let Err(e) = mounted.handle.unmount().await {
        tracing::warn!(
            sandbox_id = %mounted.sandbox_id(),
            error = %e,
            "sandbox teardown failed"
        );
    }
}

/// Decrements the entry's reference count when dropped.
struct RefGuard {
    cache: Weak<Inner>,
    name: String,
    generation: u64,
}

impl Drop for RefGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            inner.release(&self.name, self.generation);
        }
    }
}

/// Counted borrow of a cached sandbox. The entry cannot idle out while any
/// lease is alive; an explicit `evict` still tears it down.
pub struct WorkspaceLease {
    mounted: Arc<MountedWorkspace>,
    _guard: RefGuard,
}

impl WorkspaceLease {
    /// True if both leases point at the same mounted sandbox.
    pub fn same_sandbox(&self, other: &WorkspaceLease) -> bool {
        Arc::ptr_eq(&self.mounted, &other.mounted)
    }
}

impl Clone for WorkspaceLease {
    fn clone(&self) -> Self {
        let guard = &self._guard;
        if let Some(inner) = guard.cache.upgrade() {
            inner.acquire(&guard.name, guard.generation);
        }
        Self {
            mounted: self.mounted.clone(),
            _guard: RefGuard {
                cache: guard.cache.clone(),
                name: guard.name.clone(),
                generation: guard.generation,
            },
        }
    }
}

impl Deref for WorkspaceLease {
    type Target = MountedWorkspace;

    fn deref(&self) -> &Self::Target {
        &self.mounted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::memory::MemoryProvider;
    use crate::workspace::File;

    fn setup(
        provider: MemoryProvider,
        ttl: Duration,
        capacity: usize,
    ) -> (Arc<MemoryProvider>, WorkspaceCache) {
        let provider = Arc::new(provider);
        let client = Arc::new(SandboxRuntimeClient::new(provider.clone()));
        let cache = WorkspaceCache::new(client, CacheConfig { ttl, capacity });
        (provider, cache)
    }

    fn ws(name: &str) -> Workspace {
        Workspace::new(name, vec![File::new("index.ts", "console.log(1)").into()])
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_gets_mount_once() {
        let (provider, cache) = setup(
            MemoryProvider::new().with_mount_delay(Duration::from_millis(50)),
            Duration::from_secs(5),
            4,
        );
        let workspace = ws("shared");
        let calls: Vec<_> = (0..10).map(|_| cache.get(&workspace)).collect();
        let leases: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(provider.stats().mounts, 1);
        assert_eq!(provider.stats().boots, 1);
        assert!(leases.iter().all(|l| l.same_sandbox(&leases[0])));
        assert_eq!(cache.refs("shared"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_gets_within_ttl_share_handle() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        let workspace = ws("a");

        let first = cache.get(&workspace).await.unwrap();
        let first_id = first.sandbox_id().to_string();
        drop(first);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = cache.get(&workspace).await.unwrap();

        assert_eq!(second.sandbox_id(), first_id);
        assert_eq!(provider.stats().mounts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entry_torn_down_at_ttl_not_before() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        let lease = cache.get(&ws("idle")).await.unwrap();
        drop(lease);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(cache.contains("idle"));
        assert_eq!(provider.stats().unmounts, 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!cache.contains("idle"));
        assert_eq!(provider.stats().unmounts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn held_lease_pins_entry() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(1), 4);
        let lease = cache.get(&ws("pinned")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.contains("pinned"));
        drop(lease);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!cache.contains("pinned"));
        assert_eq!(provider.stats().unmounts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hit_restarts_idle_timer() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        let workspace = ws("reset");
        drop(cache.get(&workspace).await.unwrap());
        tokio::time::sleep(Duration::from_secs(4)).await;
        drop(cache.get(&workspace).await.unwrap());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.contains("reset"));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!cache.contains("reset"));
        assert_eq!(provider.stats().mounts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cloned_lease_counts_as_reference() {
        let (_provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(1), 4);
        let lease = cache.get(&ws("clone")).await.unwrap();
        let copy = lease.clone();
        assert_eq!(cache.refs("clone"), 2);
        drop(lease);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.contains("clone"));
        drop(copy);
        assert_eq!(cache.refs("clone"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mount_errors_reach_all_waiters_and_are_not_cached() {
        let (provider, cache) = setup(
            MemoryProvider::new().with_mount_delay(Duration::from_millis(20)),
            Duration::from_secs(5),
            4,
        );
        provider.fail_next_mounts(1);
        let workspace = ws("flaky");

        let (a, b) = tokio::join!(cache.get(&workspace), cache.get(&workspace));
        assert!(matches!(a, Err(SandboxError::Mount(_))));
        assert!(matches!(b, Err(SandboxError::Mount(_))));
        assert!(!cache.contains("flaky"));

        let lease = cache.get(&workspace).await.unwrap();
        assert_eq!(provider.stats().mounts, 2);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_unavailable_surfaces_to_caller() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        provider.fail_boot("no isolation");
        let err = cache.get(&ws("x")).await.err().unwrap();
        assert!(err.is_fatal());
        assert!(cache.get(&ws("y")).await.err().unwrap().is_fatal());
        assert_eq!(provider.stats().mounts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_least_recently_used_idle_entry() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(60), 2);
        drop(cache.get(&ws("one")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(cache.get(&ws("two")).await.unwrap());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _three = cache.get(&ws("three")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!cache.contains("one"));
        assert!(cache.contains("two"));
        assert!(cache.contains("three"));
        assert_eq!(provider.stats().unmounts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_entries_are_never_evicted_for_capacity() {
        let (_provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(60), 1);
        let _a = cache.get(&ws("a")).await.unwrap();
        let _b = cache.get(&ws("b")).await.unwrap();
        assert!(cache.contains("a"));
        assert!(cache.contains("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_different_tree_shares_sandbox() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        let a = cache.get(&ws("same")).await.unwrap();
        let other = Workspace::new("same", vec![File::new("main.rs", "fn main() {}").into()]);
        let b = cache.get(&other).await.unwrap();
        assert!(a.same_sandbox(&b));
        assert_eq!(provider.stats().mounts, 1);
        assert!(b.workspace().contains("index.ts"));
    }

    #[tokio::test(start_paused = true)]
    async fn evict_and_shutdown_tear_down() {
        let (provider, cache) = setup(MemoryProvider::new(), Duration::from_secs(5), 4);
        let _a = cache.get(&ws("a")).await.unwrap();
        drop(cache.get(&ws("b")).await.unwrap());

        assert!(cache.evict("a").await);
        assert!(!cache.evict("a").await);
        assert_eq!(provider.stats().unmounts, 1);

        cache.shutdown().await;
        assert!(cache.is_empty());
        assert_eq!(provider.stats().unmounts, 2);
    }
}
