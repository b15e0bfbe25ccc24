//! Pool state machine: acquired set, idle queue and caller wait queue.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::manager::Manager;

/// Pool-local identity of a resource. Never reused.
pub type ResourceId = u64;

type Handoff<R> = Result<(ResourceId, R), PoolError>;

/// Configuration for a [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum resources alive or in creation (default: 10).
    pub size: usize,
    /// Callers allowed to queue once every slot is busy (default: 0, so a
    /// saturated pool rejects immediately).
    pub max_waiting: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            max_waiting: 0,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    /// Resources created and not yet removed (leased + idle).
    pub acquired: usize,
    /// Valid resources sitting in the idle queue.
    pub idle: usize,
    /// Creations in flight.
    pub creating: usize,
    /// Callers queued for a resource.
    pub waiting: usize,
    /// Failed creation attempts since the pool was built.
    pub failures: u64,
}

struct IdleEntry<R> {
    id: ResourceId,
    resource: R,
    since: Instant,
    /// Freshly created resources skip the liveness check.
    fresh: bool,
}

struct State<R> {
    /// The "all acquired" set. Idle entries whose id is missing are stale.
    live: HashSet<ResourceId>,
    idle: VecDeque<IdleEntry<R>>,
    waiters: VecDeque<oneshot::Sender<Handoff<R>>>,
    creating: usize,
    failures: u64,
    next_id: ResourceId,
    draining: bool,
}

impl<R> State<R> {
    /// Queued callers that no in-flight creation is going to serve.
    fn uncovered(&self) -> usize {
        self.waiters.len().saturating_sub(self.creating)
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }

    fn idle_count(&self) -> usize {
        self.idle
            .iter()
            .filter(|e| self.live.contains(&e.id))
            .count()
    }
}

struct Shared<M: Manager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<State<M::Resource>>,
}

impl<M: Manager> Shared<M> {
    fn lock(&self) -> MutexGuard<'_, State<M::Resource>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Match idle resources to queued callers, oldest caller first.
    fn dispatch(&self, state: &mut State<M::Resource>) {
        while !state.waiters.is_empty() {
            let Some(mut entry) = state.idle.pop_front() else {
                break;
            };
            if !state.live.contains(&entry.id) {
                debug!(resource = entry.id, "skipped stale idle entry");
                self.manager.close(entry.resource);
                continue;
            }
            if !entry.fresh && !self.manager.ping(&mut entry.resource) {
                state.live.remove(&entry.id);
                warn!(resource = entry.id, "idle resource failed ping, discarded");
                self.manager.close(entry.resource);
                continue;
            }
            let id = entry.id;
            if let Some((id, resource)) = hand_over(&mut state.waiters, id, entry.resource) {
                // Every queued caller had gone away.
                state.idle.push_front(IdleEntry {
                    id,
                    resource,
                    since: entry.since,
                    fresh: entry.fresh,
                });
                break;
            }
            debug!(resource = id, "resource handed to queued caller");
        }
    }

    /// Reserve creation slots for callers no idle resource or in-flight
    /// creation will serve. Returns how many creations to start.
    fn reserve_creations(&self, state: &mut State<M::Resource>) -> usize {
        let mut reserved = 0;
        while state.uncovered() > 0 && state.live.len() + state.creating < self.config.size {
            state.creating += 1;
            reserved += 1;
        }
        reserved
    }

    /// Dispatch, top up creations and unlock.
    fn settle(self: &Arc<Self>, mut state: MutexGuard<'_, State<M::Resource>>) {
        self.dispatch(&mut state);
        let reserved = self.reserve_creations(&mut state);
        drop(state);
        self.spawn_creations(reserved);
    }

    fn spawn_creations(self: &Arc<Self>, count: usize) {
        if count == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(count, "no runtime to create resources on");
            let mut state = self.lock();
            state.creating = state.creating.saturating_sub(count);
            return;
        };
        for _ in 0..count {
            let shared = Arc::clone(self);
            handle.spawn(async move {
                let result = shared.manager.create().await;
                shared.finish_create(result);
            });
        }
    }

    fn finish_create(self: &Arc<Self>, result: Result<M::Resource, M::Error>) {
        let mut state = self.lock();
        state.creating = state.creating.saturating_sub(1);
        match result {
            Ok(resource) => {
                if state.draining {
                    self.manager.close(resource);
                    return;
                }
                let id = state.next_id;
                state.next_id += 1;
                state.live.insert(id);
                debug!(resource = id, acquired = state.live.len(), "created resource");
                state.idle.push_back(IdleEntry {
                    id,
                    resource,
                    since: Instant::now(),
                    fresh: true,
                });
                self.settle(state);
            }
            Err(e) => {
                state.failures += 1;
                warn!(error = %e, failures = state.failures, "resource creation failed");
                state.prune_waiters();
                if state.uncovered() > 0 {
                    if let Some(waiter) = state.waiters.pop_front() {
                        let _ = waiter.send(Err(PoolError::Create(e.to_string())));
                    }
                }
            }
        }
    }

    fn release(self: &Arc<Self>, id: ResourceId, mut resource: M::Resource) {
        let mut state = self.lock();
        let keep = state.live.contains(&id)
            && !state.draining
            && self.manager.on_release(&mut resource);
        if !keep {
            state.live.remove(&id);
            self.manager.close(resource);
            debug!(resource = id, "resource discarded on release");
            self.settle(state);
            return;
        }
        state.idle.push_back(IdleEntry {
            id,
            resource,
            since: Instant::now(),
            fresh: false,
        });
        self.settle(state);
    }

    fn discard(self: &Arc<Self>, id: ResourceId, resource: M::Resource) {
        let mut state = self.lock();
        state.live.remove(&id);
        self.manager.close(resource);
        debug!(resource = id, acquired = state.live.len(), "resource removed");
        self.settle(state);
    }
}

/// Give `resource` to the oldest caller still waiting. Returns it back if
/// nobody is left.
fn hand_over<R>(
    waiters: &mut VecDeque<oneshot::Sender<Handoff<R>>>,
    id: ResourceId,
    resource: R,
) -> Option<(ResourceId, R)> {
    let mut item = (id, resource);
    while let Some(waiter) = waiters.pop_front() {
        match waiter.send(Ok(item)) {
            Ok(()) => return None,
            Err(rejected) => item = rejected.ok()?,
        }
    }
    Some(item)
}

/// Bounded pool of resources built by a [`Manager`].
pub struct Pool<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> Pool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(State {
                    live: HashSet::new(),
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    creating: 0,
                    failures: 0,
                    next_id: 1,
                    draining: false,
                }),
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Queue for a resource.
    ///
    /// The caller is served from the idle queue if possible; otherwise a
    /// creation is started when the pool is below its size cap. With every
    /// slot busy and `max_waiting` callers already queued the request is
    /// rejected with [`PoolError::Exhausted`]. Must be called inside a tokio
    /// runtime.
    pub fn request(&self) -> PoolResult<Pending<M>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.shared.lock();
        if state.draining {
            return Err(PoolError::Draining);
        }
        state.prune_waiters();
        state.waiters.push_back(tx);
        self.shared.dispatch(&mut state);
        let reserved = self.shared.reserve_creations(&mut state);

        let outcome = if state.uncovered() > self.shared.config.max_waiting {
            // Our sender is the newest entry; everything ahead of it is older.
            state.waiters.pop_back();
            let err = PoolError::Exhausted {
                size: self.shared.config.size,
                waiting: state.waiters.len(),
            };
            debug!(%err, "request rejected");
            Err(err)
        } else {
            Ok(Pending {
                shared: Arc::clone(&self.shared),
                rx,
            })
        };
        drop(state);
        self.shared.spawn_creations(reserved);
        outcome
    }

    /// Request a resource and wait up to `timeout` for it.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<Lease<M>> {
        let pending = self.request()?;
        tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
    }

    /// Return a leased resource. Same as dropping the lease.
    pub fn release(&self, lease: Lease<M>) {
        drop(lease);
    }

    /// Close a leased resource and free its slot.
    pub fn remove(&self, lease: Lease<M>) {
        lease.remove();
    }

    /// Drop a resource from the acquired set by id, wherever it currently
    /// is. An idle copy is skipped lazily; a leased copy is closed when the
    /// lease ends. Returns whether the id was live.
    pub fn invalidate(&self, id: ResourceId) -> bool {
        let mut state = self.shared.lock();
        let removed = state.live.remove(&id);
        if removed {
            debug!(resource = id, "resource invalidated");
        }
        self.shared.settle(state);
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let mut state = self.shared.lock();
        state.prune_waiters();
        PoolStats {
            size: self.shared.config.size,
            acquired: state.live.len(),
            idle: state.idle_count(),
            creating: state.creating,
            waiting: state.waiters.len(),
            failures: state.failures,
        }
    }

    /// No caller is queued and every acquired resource is idle.
    pub fn is_idle(&self) -> bool {
        let stats = self.stats();
        stats.waiting == 0 && stats.idle == stats.acquired
    }

    /// Close idle resources unused for at least `max_idle`.
    pub fn reap_idle(&self, max_idle: Duration) -> usize {
        let mut state = self.shared.lock();
        let mut kept = VecDeque::with_capacity(state.idle.len());
        let mut reaped = 0;
        while let Some(entry) = state.idle.pop_front() {
            if !state.live.contains(&entry.id) {
                self.shared.manager.close(entry.resource);
                continue;
            }
            if entry.since.elapsed() >= max_idle {
                state.live.remove(&entry.id);
                self.shared.manager.close(entry.resource);
                reaped += 1;
                continue;
            }
            kept.push_back(entry);
        }
        state.idle = kept;
        if reaped > 0 {
            info!(reaped, remaining_idle = state.idle.len(), "reaped idle resources");
        }
        reaped
    }

    /// Stop accepting requests, fail queued callers and close idle
    /// resources. Leased resources are closed when their lease ends.
    /// Returns how many idle resources were closed.
    pub fn drain(&self) -> usize {
        let mut state = self.shared.lock();
        state.draining = true;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(Err(PoolError::Draining));
        }
        let mut closed = 0;
        while let Some(entry) = state.idle.pop_front() {
            if state.live.remove(&entry.id) {
                closed += 1;
            }
            self.shared.manager.close(entry.resource);
        }
        info!(closed, leased = state.live.len(), "pool drained");
        closed
    }
}

impl<M: Manager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A queued request. Resolves once a resource is assigned.
///
/// Dropping it cancels the request; a resource already assigned to it goes
/// back to the pool.
pub struct Pending<M: Manager> {
    shared: Arc<Shared<M>>,
    rx: oneshot::Receiver<Handoff<M::Resource>>,
}

impl<M: Manager> Future for Pending<M> {
    type Output = PoolResult<Lease<M>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok((id, resource)))) => Poll::Ready(Ok(Lease {
                shared: Arc::clone(&this.shared),
                id,
                resource: Some(resource),
            })),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Closed)),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Pending<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl<M: Manager> Drop for Pending<M> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok((id, resource))) = self.rx.try_recv() {
            self.shared.release(id, resource);
        }
    }
}

/// Exclusive use of a pooled resource. Returned to the pool on drop.
pub struct Lease<M: Manager> {
    shared: Arc<Shared<M>>,
    id: ResourceId,
    resource: Option<M::Resource>,
}

impl<M: Manager> Lease<M> {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Return the resource to the pool.
    pub fn release(self) {}

    /// Close the resource instead of returning it.
    pub fn remove(mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.discard(self.id, resource);
        }
    }
}

impl<M: Manager> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("lease holds its resource until consumed")
    }
}

impl<M: Manager> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("lease holds its resource until consumed")
    }
}

impl<M: Manager> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.release(self.id, resource);
        }
    }
}

impl<M: Manager> std::fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    // ── Mock manager ─────────────────────────────────────────────────

    struct MockManager {
        created: AtomicU64,
        closed: AtomicU64,
        should_fail: AtomicBool,
        healthy: AtomicBool,
        accept_release: AtomicBool,
    }

    impl MockManager {
        fn new() -> Self {
            Self {
                created: AtomicU64::new(0),
                closed: AtomicU64::new(0),
                should_fail: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                accept_release: AtomicBool::new(true),
            }
        }

        fn created(&self) -> u64 {
            self.created.load(Ordering::Relaxed)
        }

        fn closed(&self) -> u64 {
            self.closed.load(Ordering::Relaxed)
        }
    }

    impl Manager for MockManager {
        type Resource = u64;
        type Error = String;

        async fn create(&self) -> Result<u64, String> {
            if self.should_fail.load(Ordering::Relaxed) {
                return Err("connection refused".to_string());
            }
            Ok(self.created.fetch_add(1, Ordering::Relaxed) + 1)
        }

        fn ping(&self, _resource: &mut u64) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        fn on_release(&self, _resource: &mut u64) -> bool {
            self.accept_release.load(Ordering::Relaxed)
        }

        fn close(&self, _resource: u64) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    const WAIT: Duration = Duration::from_millis(500);

    fn make_pool(size: usize, max_waiting: usize) -> Pool<MockManager> {
        Pool::new(MockManager::new(), PoolConfig { size, max_waiting })
    }

    // ── Request / release ────────────────────────────────────────────

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.size, 10);
        assert_eq!(config.max_waiting, 0);
    }

    #[tokio::test]
    async fn request_creates_resource_via_manager() {
        let pool = make_pool(2, 0);
        let lease = pool.acquire(WAIT).await.unwrap();
        assert_eq!(*lease, 1);
        assert_eq!(pool.manager().created(), 1);
        assert_eq!(pool.stats().acquired, 1);
    }

    #[tokio::test]
    async fn released_resource_is_reused() {
        let pool = make_pool(2, 0);
        let lease = pool.acquire(WAIT).await.unwrap();
        let id = lease.id();
        pool.release(lease);
        assert_eq!(pool.stats().idle, 1);

        let again = pool.acquire(WAIT).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.manager().created(), 1);
    }

    #[tokio::test]
    async fn saturated_pool_rejects() {
        let pool = make_pool(1, 0);
        let _held = pool.acquire(WAIT).await.unwrap();
        let err = pool.request().unwrap_err();
        assert_eq!(err, PoolError::Exhausted { size: 1, waiting: 0 });
    }

    #[tokio::test]
    async fn pending_creations_count_toward_cap() {
        let pool = make_pool(2, 0);
        let _p1 = pool.request().unwrap();
        let _p2 = pool.request().unwrap();
        assert!(matches!(pool.request(), Err(PoolError::Exhausted { .. })));
        let stats = pool.stats();
        assert!(stats.acquired + stats.creating <= stats.size);
    }

    // ── Fairness ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn queued_callers_served_in_request_order() {
        let pool = make_pool(1, 8);
        let first = pool.acquire(WAIT).await.unwrap();

        let mut p1 = pool.request().unwrap();
        let mut p2 = pool.request().unwrap();
        let mut p3 = pool.request().unwrap();
        assert_eq!(pool.stats().waiting, 3);

        drop(first);
        let l1 = tokio::time::timeout(WAIT, &mut p1).await.unwrap().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut p2)
                .await
                .is_err()
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut p3)
                .await
                .is_err()
        );

        drop(l1);
        let l2 = tokio::time::timeout(WAIT, &mut p2).await.unwrap().unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut p3)
                .await
                .is_err()
        );

        drop(l2);
        let l3 = tokio::time::timeout(WAIT, &mut p3).await.unwrap().unwrap();
        assert_eq!(l3.id(), 1);
        assert_eq!(pool.manager().created(), 1);
    }

    #[tokio::test]
    async fn abandoned_caller_is_skipped() {
        let pool = make_pool(1, 2);
        let held = pool.acquire(WAIT).await.unwrap();
        let gone = pool.request().unwrap();
        let mut next = pool.request().unwrap();
        drop(gone);

        drop(held);
        let lease = tokio::time::timeout(WAIT, &mut next).await.unwrap().unwrap();
        assert_eq!(lease.id(), 1);
    }

    #[tokio::test]
    async fn resource_assigned_to_dropped_request_returns_to_pool() {
        let pool = make_pool(1, 1);
        let held = pool.acquire(WAIT).await.unwrap();
        let pending = pool.request().unwrap();
        // Hand-over happens synchronously inside drop(held).
        drop(held);
        drop(pending);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 1);
        assert_eq!(stats.idle, 1);
        assert!(pool.is_idle());
    }

    // ── Removal ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn invalidated_lease_is_closed_on_release() {
        let pool = make_pool(2, 0);
        let lease = pool.acquire(WAIT).await.unwrap();
        assert!(pool.invalidate(lease.id()));
        assert_eq!(pool.stats().acquired, 0);

        drop(lease);
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(pool.manager().closed(), 1);
    }

    #[tokio::test]
    async fn stale_idle_entry_is_skipped() {
        let pool = make_pool(2, 0);
        let lease = pool.acquire(WAIT).await.unwrap();
        let stale = lease.id();
        drop(lease);
        pool.invalidate(stale);
        assert_eq!(pool.stats().idle, 0);

        let fresh = pool.acquire(WAIT).await.unwrap();
        assert_ne!(fresh.id(), stale);
        assert_eq!(pool.manager().created(), 2);
        assert_eq!(pool.manager().closed(), 1);
    }

    #[tokio::test]
    async fn remove_frees_slot_for_waiter() {
        let pool = make_pool(1, 1);
        let held = pool.acquire(WAIT).await.unwrap();
        let mut pending = pool.request().unwrap();
        pool.remove(held);

        let lease = tokio::time::timeout(WAIT, &mut pending).await.unwrap().unwrap();
        assert_eq!(*lease, 2);
        assert_eq!(pool.manager().closed(), 1);
    }

    #[tokio::test]
    async fn counts_stay_bounded_under_mixed_operations() {
        let pool = make_pool(3, 2);
        let mut leases = Vec::new();

        for step in 0..60 {
            match step % 4 {
                0 | 1 => {
                    if let Ok(pending) = pool.request() {
                        if let Ok(Ok(lease)) =
                            tokio::time::timeout(Duration::from_millis(50), pending).await
                        {
                            leases.push(lease);
                        }
                    }
                }
                2 => {
                    if !leases.is_empty() {
                        leases.remove(0);
                    }
                }
                _ => {
                    if let Some(lease) = leases.pop() {
                        pool.invalidate(lease.id());
                        drop(lease);
                    }
                }
            }
            let stats = pool.stats();
            assert!(stats.acquired + stats.creating <= stats.size, "{stats:?}");
            assert!(stats.idle <= stats.acquired, "{stats:?}");
        }
    }

    // ── Manager hooks ────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_creation_does_not_wedge_pool() {
        let pool = make_pool(1, 0);
        pool.manager().should_fail.store(true, Ordering::Relaxed);

        let err = pool.acquire(WAIT).await.unwrap_err();
        assert!(matches!(err, PoolError::Create(ref m) if m.contains("connection refused")));
        assert_eq!(pool.stats().failures, 1);
        assert_eq!(pool.stats().creating, 0);

        pool.manager().should_fail.store(false, Ordering::Relaxed);
        assert!(pool.acquire(WAIT).await.is_ok());
    }

    #[tokio::test]
    async fn failed_ping_discards_idle_resource() {
        let pool = make_pool(1, 0);
        drop(pool.acquire(WAIT).await.unwrap());
        pool.manager().healthy.store(false, Ordering::Relaxed);

        let lease = pool.acquire(WAIT).await.unwrap();
        assert_eq!(*lease, 2);
        assert_eq!(pool.manager().closed(), 1);
    }

    #[tokio::test]
    async fn rejected_release_discards_resource() {
        let pool = make_pool(1, 0);
        pool.manager().accept_release.store(false, Ordering::Relaxed);
        drop(pool.acquire(WAIT).await.unwrap());

        let stats = pool.stats();
        assert_eq!(stats.acquired, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(pool.manager().closed(), 1);
    }

    // ── Maintenance ──────────────────────────────────────────────────

    #[tokio::test]
    async fn reap_idle_closes_old_resources() {
        let pool = make_pool(2, 0);
        drop(pool.acquire(WAIT).await.unwrap());
        assert_eq!(pool.reap_idle(Duration::ZERO), 1);
        assert_eq!(pool.stats().acquired, 0);
        assert_eq!(pool.manager().closed(), 1);
    }

    #[tokio::test]
    async fn reap_idle_keeps_recent_resources() {
        let pool = make_pool(2, 0);
        drop(pool.acquire(WAIT).await.unwrap());
        assert_eq!(pool.reap_idle(Duration::from_secs(300)), 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn drain_rejects_requests_and_closes_everything() {
        let pool = make_pool(2, 0);
        let held = pool.acquire(WAIT).await.unwrap();
        drop(pool.acquire(WAIT).await.unwrap());

        assert_eq!(pool.drain(), 1);
        assert!(matches!(pool.request(), Err(PoolError::Draining)));

        drop(held);
        assert_eq!(pool.manager().closed(), 2);
        assert_eq!(pool.stats().acquired, 0);
    }

    #[tokio::test]
    async fn is_idle_tracks_leases() {
        let pool = make_pool(2, 0);
        assert!(pool.is_idle());
        let lease = pool.acquire(WAIT).await.unwrap();
        assert!(!pool.is_idle());
        drop(lease);
        assert!(pool.is_idle());
    }
}
