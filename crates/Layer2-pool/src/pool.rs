//! Resource pool - reference-counted singleton registry
//!
//! One live external resource per [`ResourceKey`]. Every key owns a slot
//! guarded by an async mutex; the liveness probe, the factory call, the
//! reference count update and the destroy decision for a key all happen while
//! that slot is locked, so two callers can never create duplicates for the
//! same key and a dying resource is never handed out.
//!
//! ```text
//! acquire(key) ──► lock slot ──► alive? ──yes──► ref_count += 1
//!                                  │no
//!                                  ▼
//!                         retire stale, create, ref_count = 1
//!
//! release(lease) ──► lock slot ──► ref_count -= 1 ──► 0 && !retain ──► remove + destroy
//! ```

use dockhand_foundation::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::key::ResourceKey;

/// Shared handle to a pooled resource
pub type Lease<R> = Arc<Pooled<R>>;

type Slot<R> = Arc<tokio::sync::Mutex<Option<Lease<R>>>>;

/// Create / probe / destroy operations for one resource type
#[async_trait]
pub trait ResourceLifecycle: Send + Sync + 'static {
    /// The in-process representation of the external resource
    type Resource: Send + Sync + 'static;

    /// Creation parameters that are not part of the key
    type Spec: Send + Sync;

    /// Resource kind for logs and errors
    fn kind(&self) -> &'static str;

    /// External handle (container id, agent pid, ...)
    fn handle(&self, resource: &Self::Resource) -> String;

    /// Bring up a new external resource. Partially created external state
    /// must be cleaned up before returning an error.
    async fn create(&self, key: &ResourceKey, spec: &Self::Spec) -> Result<Self::Resource>;

    /// Liveness probe. Ambiguous answers must be `false`.
    async fn is_alive(&self, resource: &Self::Resource) -> bool;

    /// Tear down the external resource, tolerating it being gone already
    async fn destroy(&self, resource: &Self::Resource) -> Result<()>;
}

/// A resource tracked by a pool
pub struct Pooled<R> {
    key: ResourceKey,
    resource: R,
    generation: u64,
    ref_count: AtomicUsize,
    killed: AtomicBool,
}

impl<R> Pooled<R> {
    fn new(key: ResourceKey, resource: R, generation: u64, ref_count: usize) -> Self {
        Self {
            key,
            resource,
            generation,
            ref_count: AtomicUsize::new(ref_count),
            killed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Monotonic per-pool counter, distinct for every created or adopted entry
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that flips the flag
    fn mark_killed(&self) -> bool {
        !self.killed.swap(true, Ordering::SeqCst)
    }

    fn retain_ref(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// `None` when the count was already zero
    fn release_ref(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

impl<R> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.resource
    }
}

/// Outcome of registering an externally discovered resource
pub enum Adoption<R> {
    /// The resource is now the key's tracked entry
    Adopted(Lease<R>),

    /// A live entry is already tracked; the discovered resource was not registered
    AlreadyTracked { tracked: Lease<R>, orphan: R },
}

/// Registry row for introspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolEntrySummary {
    pub key: ResourceKey,
    pub handle: String,
    pub ref_count: usize,
}

struct Shared<L: ResourceLifecycle> {
    lifecycle: L,
    slots: Mutex<HashMap<ResourceKey, Slot<L::Resource>>>,
    generation: AtomicU64,
}

/// Generic reference-counted pool. Clones share the same registry.
pub struct ResourcePool<L: ResourceLifecycle> {
    shared: Arc<Shared<L>>,
}

impl<L: ResourceLifecycle> Clone for ResourcePool<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: ResourceLifecycle> ResourcePool<L> {
    pub fn new(lifecycle: L) -> Self {
        Self {
            shared: Arc::new(Shared {
                lifecycle,
                slots: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn lifecycle(&self) -> &L {
        &self.shared.lifecycle
    }

    // Slots are never removed so a waiter can never end up holding a slot
    // that is no longer registered.
    fn slot(&self, key: &ResourceKey) -> Slot<L::Resource> {
        let mut slots = self.shared.slots.lock();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn next_generation(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Get the live resource for `key`, creating it when absent or dead
    pub async fn acquire(&self, key: ResourceKey, spec: &L::Spec) -> Result<Lease<L::Resource>> {
        let kind = self.shared.lifecycle.kind();
        let slot = self.slot(&key);
        let mut current = slot.lock().await;

        let reusable = match current.as_ref() {
            Some(existing) if !existing.is_killed() => {
                self.shared.lifecycle.is_alive(existing.resource()).await
            }
            _ => false,
        };

        if reusable {
            if let Some(existing) = current.as_ref() {
                let count = existing.retain_ref();
                debug!(
                    "Reusing {} {} ({}), ref_count={}",
                    kind,
                    key,
                    self.shared.lifecycle.handle(existing.resource()),
                    count
                );
                return Ok(Arc::clone(existing));
            }
        }

        if let Some(stale) = current.take() {
            warn!(
                "{} {} ({}) is no longer alive, replacing it",
                kind,
                key,
                self.shared.lifecycle.handle(stale.resource())
            );
            self.retire(&stale).await;
        }

        let resource = self.shared.lifecycle.create(&key, spec).await?;
        let lease = Arc::new(Pooled::new(key, resource, self.next_generation(), 1));
        info!(
            "Created {} {} ({})",
            kind,
            lease.key(),
            self.shared.lifecycle.handle(lease.resource())
        );
        *current = Some(Arc::clone(&lease));
        Ok(lease)
    }

    /// Drop one reference. At zero the resource is destroyed unless `retain`
    /// is set. Never fails: destroy errors are logged.
    pub async fn release(&self, lease: &Lease<L::Resource>, retain: bool) {
        let kind = self.shared.lifecycle.kind();
        let slot = self.slot(lease.key());
        let mut current = slot.lock().await;

        let remaining = match lease.release_ref() {
            Some(remaining) => remaining,
            None => {
                warn!(
                    "Release of {} {} with no outstanding references ignored",
                    kind,
                    lease.key()
                );
                return;
            }
        };

        if remaining > 0 {
            debug!("Released {} {}, ref_count={}", kind, lease.key(), remaining);
            return;
        }

        let is_current = current
            .as_ref()
            .map_or(false, |tracked| Arc::ptr_eq(tracked, lease));

        if !is_current {
            // Already replaced or removed; only the last holder cleans up
            self.retire(lease).await;
            return;
        }

        if retain {
            info!(
                "Keeping {} {} ({}) alive with no users",
                kind,
                lease.key(),
                self.shared.lifecycle.handle(lease.resource())
            );
            return;
        }

        current.take();
        self.retire(lease).await;
    }

    /// Acquire, run `f`, and release on every exit path. If the returned
    /// future is dropped before completion or `f` panics, the release runs on
    /// a spawned task.
    pub async fn with_lease<F, Fut, T>(
        &self,
        key: ResourceKey,
        spec: &L::Spec,
        retain: bool,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Lease<L::Resource>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.guard(self.acquire(key, spec).await?, retain);
        let result = f(Arc::clone(guard.lease())).await;
        guard.release().await;
        result
    }

    /// Tie `lease` to a guard that releases it when dropped
    pub fn guard(&self, lease: Lease<L::Resource>, retain: bool) -> LeaseGuard<L> {
        LeaseGuard {
            pool: self.clone(),
            lease,
            retain,
            armed: true,
        }
    }

    /// Register a resource found in the outside world. A live tracked entry
    /// wins; a dead one is replaced.
    pub async fn adopt(
        &self,
        key: ResourceKey,
        resource: L::Resource,
        ref_count: usize,
    ) -> Adoption<L::Resource> {
        let kind = self.shared.lifecycle.kind();
        let slot = self.slot(&key);
        let mut current = slot.lock().await;

        let tracked_alive = match current.as_ref() {
            Some(existing) if !existing.is_killed() => {
                self.shared.lifecycle.is_alive(existing.resource()).await
            }
            _ => false,
        };

        if tracked_alive {
            if let Some(tracked) = current.as_ref() {
                return Adoption::AlreadyTracked {
                    tracked: Arc::clone(tracked),
                    orphan: resource,
                };
            }
        }

        if let Some(stale) = current.take() {
            self.retire(&stale).await;
        }

        let lease = Arc::new(Pooled::new(key, resource, self.next_generation(), ref_count));
        info!(
            "Adopted {} {} ({})",
            kind,
            lease.key(),
            self.shared.lifecycle.handle(lease.resource())
        );
        *current = Some(Arc::clone(&lease));
        Adoption::Adopted(lease)
    }

    /// Destroy a resource that never entered the registry
    pub async fn discard(&self, resource: L::Resource) -> Result<()> {
        let handle = self.shared.lifecycle.handle(&resource);
        info!("Discarding untracked {} ({})", self.shared.lifecycle.kind(), handle);
        self.shared.lifecycle.destroy(&resource).await
    }

    /// Tracked entry for `key`, without taking a reference
    pub async fn get(&self, key: &ResourceKey) -> Option<Lease<L::Resource>> {
        let slot = {
            let slots = self.shared.slots.lock();
            slots.get(key).cloned()
        }?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Number of tracked entries
    pub async fn len(&self) -> usize {
        self.snapshot().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tracked entries, sorted by key
    pub async fn snapshot(&self) -> Vec<PoolEntrySummary> {
        let slots: Vec<Slot<L::Resource>> = self.shared.slots.lock().values().cloned().collect();
        let mut rows = Vec::with_capacity(slots.len());
        for slot in slots {
            let current = slot.lock().await;
            if let Some(entry) = current.as_ref() {
                rows.push(PoolEntrySummary {
                    key: entry.key().clone(),
                    handle: self.shared.lifecycle.handle(entry.resource()),
                    ref_count: entry.ref_count(),
                });
            }
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Destroy every tracked entry regardless of its reference count
    pub async fn drain(&self) -> usize {
        let slots: Vec<Slot<L::Resource>> = self.shared.slots.lock().values().cloned().collect();
        let mut drained = 0;
        for slot in slots {
            let mut current = slot.lock().await;
            if let Some(entry) = current.take() {
                self.retire(&entry).await;
                drained += 1;
            }
        }
        drained
    }

    async fn retire(&self, entry: &Lease<L::Resource>) {
        if !entry.mark_killed() {
            return;
        }
        let kind = self.shared.lifecycle.kind();
        let handle = self.shared.lifecycle.handle(entry.resource());
        match self.shared.lifecycle.destroy(entry.resource()).await {
            Ok(()) => info!("Destroyed {} {} ({})", kind, entry.key(), handle),
            Err(e) => warn!(
                "Failed to destroy {} {} ({}), forgetting it: {}",
                kind,
                entry.key(),
                handle,
                e
            ),
        }
    }
}

/// Holds one reference and gives it back exactly once.
///
/// [`release`](LeaseGuard::release) returns the reference and waits for it.
/// Dropping an armed guard (cancelled task, panic) spawns the release on the
/// current tokio runtime instead.
pub struct LeaseGuard<L: ResourceLifecycle> {
    pool: ResourcePool<L>,
    lease: Lease<L::Resource>,
    retain: bool,
    armed: bool,
}

impl<L: ResourceLifecycle> LeaseGuard<L> {
    pub fn lease(&self) -> &Lease<L::Resource> {
        &self.lease
    }

    /// Release now. The release itself runs on its own task, so dropping this
    /// future part way still completes it.
    pub async fn release(mut self) {
        self.armed = false;
        let (pool, lease, retain) = (self.pool.clone(), Arc::clone(&self.lease), self.retain);
        if let Err(e) = tokio::spawn(async move { pool.release(&lease, retain).await }).await {
            warn!("Release task for {} failed: {}", self.lease.key(), e);
        }
    }
}

impl<L: ResourceLifecycle> Drop for LeaseGuard<L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let kind = self.pool.lifecycle().kind();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("{} {} abandoned mid-use, releasing in background", kind, self.lease.key());
                let (pool, lease, retain) = (self.pool.clone(), Arc::clone(&self.lease), self.retain);
                runtime.spawn(async move { pool.release(&lease, retain).await });
            }
            Err(_) => warn!(
                "{} {} abandoned outside a runtime, reference leaked",
                kind,
                self.lease.key()
            ),
        }
    }
}
