// Per-tenant bounded FIFO queues with round-robin dispatch to queriers.
//
// The queue set is the rendezvous between HTTP handlers (enqueue) and
// querier streams (dequeue). Fairness is round-robin across tenants with
// pending work; a per-tenant querier cap restricts which queriers may
// serve a tenant via a deterministic shard of the connected worker set.
use quill_wire::HttpRequest;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("too many outstanding requests")]
    Full,
    #[error("no tenant id")]
    NoTenant,
    #[error("queue stopped")]
    Stopped,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DequeueError {
    #[error("queue stopped")]
    Stopped,
}

/// Identifier for a connected querier, stable for the lifetime of its
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A queued query waiting for a querier.
#[derive(Debug)]
pub struct Envelope {
    pub query_id: u64,
    pub tenant: String,
    pub request: HttpRequest,
    pub deadline: Option<Instant>,
    pub enqueued_at: Instant,
}

impl Envelope {
    pub fn new(query_id: u64, tenant: impl Into<String>, request: HttpRequest) -> Self {
        Self {
            query_id,
            tenant: tenant.into(),
            request,
            deadline: None,
            enqueued_at: Instant::now(),
        }
    }
}

/// Per-tenant dispatch limits.
pub trait Limits: Send + Sync + 'static {
    /// Maximum number of distinct queriers allowed to serve this tenant
    /// concurrently. 0 means every connected querier may serve it.
    fn max_queriers_per_tenant(&self, tenant: &str) -> usize;
}

/// The same cap for every tenant.
#[derive(Debug, Clone, Copy)]
pub struct FixedLimits(pub usize);

impl Limits for FixedLimits {
    fn max_queriers_per_tenant(&self, _tenant: &str) -> usize {
        self.0
    }
}

impl<F> Limits for F
where
    F: Fn(&str) -> usize + Send + Sync + 'static,
{
    fn max_queriers_per_tenant(&self, tenant: &str) -> usize {
        self(tenant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Stopping,
    Stopped,
}

struct TenantQueue {
    queue: VecDeque<Envelope>,
    // Queriers allowed to serve this tenant; None means all of them.
    shard: Option<HashSet<WorkerId>>,
    max_queriers: usize,
}

impl TenantQueue {
    fn eligible(&self, worker: WorkerId) -> bool {
        match &self.shard {
            None => true,
            Some(shard) => shard.contains(&worker),
        }
    }
}

struct Inner {
    state: State,
    tenants: HashMap<String, TenantQueue>,
    // Round-robin order; always has the same key set as `tenants`.
    order: Vec<String>,
    cursor: usize,
    workers: BTreeSet<WorkerId>,
}

impl Inner {
    // Lazy removal of queues observed empty during dispatch.
    fn remove_empty(&mut self) {
        let mut idx = 0;
        while idx < self.order.len() {
            let empty = self
                .tenants
                .get(&self.order[idx])
                .map(|tq| tq.queue.is_empty())
                .unwrap_or(true);
            if empty {
                let tenant = self.order.remove(idx);
                self.tenants.remove(&tenant);
                if idx < self.cursor {
                    self.cursor -= 1;
                }
            } else {
                idx += 1;
            }
        }
        if self.order.is_empty() {
            self.cursor = 0;
        }
    }

    fn pending_total(&self) -> usize {
        self.tenants.values().map(|tq| tq.queue.len()).sum()
    }

    fn recompute_shards(&mut self) {
        let workers: Vec<WorkerId> = self.workers.iter().copied().collect();
        for (tenant, tq) in self.tenants.iter_mut() {
            tq.shard = shard_for(tenant, &workers, tq.max_queriers);
        }
    }
}

/// Multiplexer of per-tenant queues with querier-driven dispatch.
///
/// ```
/// use quill_queue::{Envelope, FixedLimits, QueueSet, WorkerId};
/// use quill_wire::HttpRequest;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let queues = QueueSet::new(100, FixedLimits(0));
///     queues.add_worker(WorkerId(1));
///     queues
///         .enqueue(Envelope::new(1, "tenant-a", HttpRequest::default()))
///         .expect("enqueue");
///     let (_tx, mut shutdown) = tokio::sync::watch::channel(false);
///     let envelope = queues
///         .dequeue(WorkerId(1), &mut shutdown)
///         .await
///         .expect("dequeue");
///     assert_eq!(envelope.query_id, 1);
/// });
/// ```
pub struct QueueSet {
    inner: Mutex<Inner>,
    notify: Notify,
    limits: Arc<dyn Limits>,
    max_outstanding_per_tenant: usize,
}

impl QueueSet {
    pub fn new(max_outstanding_per_tenant: usize, limits: impl Limits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Running,
                tenants: HashMap::new(),
                order: Vec::new(),
                cursor: 0,
                workers: BTreeSet::new(),
            }),
            notify: Notify::new(),
            limits: Arc::new(limits),
            max_outstanding_per_tenant,
        }
    }

    /// Queue an envelope for its tenant. Fails fast; never blocks.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        if envelope.tenant.is_empty() {
            return Err(EnqueueError::NoTenant);
        }
        let mut inner = self.inner.lock().expect("queue lock");
        if inner.state != State::Running {
            return Err(EnqueueError::Stopped);
        }
        let tenant = envelope.tenant.clone();
        if !inner.tenants.contains_key(&tenant) {
            let max_queriers = self.limits.max_queriers_per_tenant(&tenant);
            let workers: Vec<WorkerId> = inner.workers.iter().copied().collect();
            let shard = shard_for(&tenant, &workers, max_queriers);
            inner.tenants.insert(
                tenant.clone(),
                TenantQueue {
                    queue: VecDeque::new(),
                    shard,
                    max_queriers,
                },
            );
            inner.order.push(tenant.clone());
        }
        let tq = inner.tenants.get_mut(&tenant).expect("tenant just inserted");
        if tq.queue.len() >= self.max_outstanding_per_tenant {
            return Err(EnqueueError::Full);
        }
        tq.queue.push_back(envelope);
        let depth = tq.queue.len();
        drop(inner);
        metrics::gauge!("quill_queue_length", "tenant" => tenant).set(depth as f64);
        // Wake every blocked querier; shard rules decide who may take it.
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next envelope this querier is allowed to serve.
    ///
    /// Returns [`DequeueError::Stopped`] once the queue set is stopped or
    /// the caller's shutdown signal fires.
    pub async fn dequeue(
        &self,
        worker: WorkerId,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Envelope, DequeueError> {
        loop {
            if *shutdown.borrow() {
                return Err(DequeueError::Stopped);
            }
            // Register for wakeups before scanning so an enqueue between
            // the scan and the await is never lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("queue lock");
                if inner.state == State::Stopped {
                    return Err(DequeueError::Stopped);
                }
                if let Some(envelope) = Self::scan(&mut inner, worker) {
                    metrics::histogram!("quill_queue_wait_seconds")
                        .record(envelope.enqueued_at.elapsed().as_secs_f64());
                    return Ok(envelope);
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Err(DequeueError::Stopped);
                    }
                }
            }
        }
    }

    // Round-robin scan from the cursor. Empty tenants are skipped without
    // consuming the cursor's credit and swept once the dispatch is done.
    fn scan(inner: &mut Inner, worker: WorkerId) -> Option<Envelope> {
        let len = inner.order.len();
        if len == 0 {
            return None;
        }
        let start = inner.cursor % len;
        let mut found = None;
        for step in 0..len {
            let idx = (start + step) % len;
            let tq = inner
                .tenants
                .get(&inner.order[idx])
                .expect("order and tenant map share keys");
            if !tq.queue.is_empty() && tq.eligible(worker) {
                found = Some(idx);
                break;
            }
        }
        let idx = found?;
        let tenant = inner.order[idx].clone();
        let tq = inner.tenants.get_mut(&tenant).expect("tenant present");
        let envelope = tq.queue.pop_front().expect("queue non-empty");
        let depth = tq.queue.len();
        inner.cursor = (idx + 1) % len;
        inner.remove_empty();
        metrics::gauge!("quill_queue_length", "tenant" => tenant).set(depth as f64);
        Some(envelope)
    }

    /// Register a connected querier and refresh tenant shards.
    pub fn add_worker(&self, worker: WorkerId) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.workers.insert(worker);
        inner.recompute_shards();
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Deregister a querier and refresh tenant shards.
    pub fn remove_worker(&self, worker: WorkerId) {
        let mut inner = self.inner.lock().expect("queue lock");
        inner.workers.remove(&worker);
        inner.recompute_shards();
    }

    pub fn pending_total(&self) -> usize {
        self.inner.lock().expect("queue lock").pending_total()
    }

    /// Stop accepting work, drain what is queued, then wake every blocked
    /// querier with [`DequeueError::Stopped`].
    pub async fn stop(&self, drain_timeout: Duration) {
        {
            let mut inner = self.inner.lock().expect("queue lock");
            if inner.state != State::Running {
                return;
            }
            inner.state = State::Stopping;
        }
        let deadline = Instant::now() + drain_timeout;
        loop {
            if self.pending_total() == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let mut inner = self.inner.lock().expect("queue lock");
            inner.state = State::Stopped;
        }
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn shard_of(&self, tenant: &str) -> Option<HashSet<WorkerId>> {
        let inner = self.inner.lock().expect("queue lock");
        inner.tenants.get(tenant).and_then(|tq| tq.shard.clone())
    }
}

// Rendezvous hash: every (tenant, worker) pair gets a stable score and the
// `cap` best-scoring workers form the tenant's shard. Worker churn outside
// the shard leaves it untouched.
fn shard_for(tenant: &str, workers: &[WorkerId], cap: usize) -> Option<HashSet<WorkerId>> {
    if cap == 0 || cap >= workers.len() {
        return None;
    }
    let mut scored: Vec<(u64, WorkerId)> = workers
        .iter()
        .map(|worker| {
            let mut hasher = DefaultHasher::new();
            tenant.hash(&mut hasher);
            worker.0.hash(&mut hasher);
            (hasher.finish(), *worker)
        })
        .collect();
    scored.sort_unstable();
    Some(scored.into_iter().take(cap).map(|(_, worker)| worker).collect())
}
