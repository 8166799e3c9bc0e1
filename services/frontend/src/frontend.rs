// Frontend core state: query-id allocation, the pending-result table,
// and connected-querier accounting.
//
// The pending table is the correlation point between HTTP handlers and
// querier streams: an entry is inserted before its envelope is queued
// and removed exactly once — by result delivery, by the handler's
// cancellation guard, or by the handler's deadline.
use crate::error::QueryError;
use quill_queue::{Envelope, EnqueueError, QueueSet, WorkerId};
use quill_wire::{HttpResponse, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

pub type QueryResult = std::result::Result<HttpResponse, QueryError>;

struct Pending {
    response_tx: oneshot::Sender<QueryResult>,
    // Writer channel of the stream the query was dispatched on; None
    // while the query is still queued.
    dispatched: Option<mpsc::Sender<Message>>,
    worker_lost: bool,
}

pub struct Frontend {
    queues: Arc<QueueSet>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_query_id: AtomicU64,
    connected_workers: AtomicUsize,
}

impl Frontend {
    pub fn new(queues: Arc<QueueSet>) -> Self {
        Self {
            queues,
            pending: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(0),
            connected_workers: AtomicUsize::new(0),
        }
    }

    pub fn queues(&self) -> &Arc<QueueSet> {
        &self.queues
    }

    /// Unique for the lifetime of this frontend.
    pub fn next_query_id(&self) -> u64 {
        self.next_query_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert the single-shot delivery slot for a query. Must happen
    /// before the envelope can reach any querier.
    pub fn register(&self, query_id: u64) -> oneshot::Receiver<QueryResult> {
        let (response_tx, response_rx) = oneshot::channel();
        let previous = self.pending.lock().expect("pending lock").insert(
            query_id,
            Pending {
                response_tx,
                dispatched: None,
                worker_lost: false,
            },
        );
        debug_assert!(previous.is_none(), "query id reused");
        response_rx
    }

    /// Queue the envelope; on rejection the pending entry is removed so
    /// nothing leaks.
    pub fn enqueue(&self, envelope: Envelope) -> std::result::Result<(), QueryError> {
        let query_id = envelope.query_id;
        self.queues.enqueue(envelope).map_err(|err| {
            self.pending.lock().expect("pending lock").remove(&query_id);
            match err {
                EnqueueError::Full => QueryError::TooManyOutstanding,
                EnqueueError::NoTenant => QueryError::MissingTenant,
                EnqueueError::Stopped => QueryError::Stopped,
            }
        })
    }

    /// Record the stream a query was handed to. Returns false when the
    /// entry is gone (the caller cancelled while the query was queued),
    /// in which case the query must not be sent to the querier.
    pub fn mark_dispatched(&self, query_id: u64, writer: mpsc::Sender<Message>) -> bool {
        match self.pending.lock().expect("pending lock").get_mut(&query_id) {
            Some(entry) => {
                entry.dispatched = Some(writer);
                true
            }
            None => false,
        }
    }

    /// Deliver a result to the waiting handler. At-most-once: late or
    /// stray results are dropped with a warning.
    pub fn deliver(&self, query_id: u64, result: QueryResult) -> bool {
        let entry = self.pending.lock().expect("pending lock").remove(&query_id);
        match entry {
            Some(entry) => {
                // The receiver only disappears together with the entry,
                // so this send cannot miss a live handler.
                let _ = entry.response_tx.send(result);
                true
            }
            None => {
                tracing::warn!(query_id, "dropping result for unknown query");
                false
            }
        }
    }

    /// The caller is gone: drop the entry and, if the query already
    /// reached a querier, tell that stream to cancel it.
    pub fn cancel(&self, query_id: u64) {
        let entry = self.pending.lock().expect("pending lock").remove(&query_id);
        if let Some(entry) = entry {
            if let Some(writer) = entry.dispatched {
                if writer.try_send(Message::Cancel { query_id }).is_err() {
                    tracing::debug!(query_id, "cancel not sent, querier stream gone");
                }
            }
        }
    }

    /// The stream executing these queries died. Entries stay in place —
    /// the waiting handlers resolve them at their deadline — but are
    /// flagged so the failure is reported as a lost querier, not a
    /// timeout. The queries are never re-dispatched.
    pub fn mark_worker_lost(&self, query_ids: &[u64]) {
        let mut pending = self.pending.lock().expect("pending lock");
        for query_id in query_ids {
            if let Some(entry) = pending.get_mut(query_id) {
                entry.worker_lost = true;
                entry.dispatched = None;
            }
        }
    }

    /// Remove an entry whose handler hit its deadline. Returns whether
    /// the dispatched querier had been lost, or None when a result
    /// raced in first.
    pub fn take_expired(&self, query_id: u64) -> Option<bool> {
        self.pending
            .lock()
            .expect("pending lock")
            .remove(&query_id)
            .map(|entry| entry.worker_lost)
    }

    pub fn worker_connected(&self, worker: WorkerId) {
        self.connected_workers.fetch_add(1, Ordering::Relaxed);
        self.queues.add_worker(worker);
        metrics::gauge!("quill_connected_queriers")
            .set(self.connected_workers.load(Ordering::Relaxed) as f64);
    }

    pub fn worker_disconnected(&self, worker: WorkerId) {
        self.connected_workers.fetch_sub(1, Ordering::Relaxed);
        self.queues.remove_worker(worker);
        metrics::gauge!("quill_connected_queriers")
            .set(self.connected_workers.load(Ordering::Relaxed) as f64);
    }

    pub fn connected_workers(&self) -> usize {
        self.connected_workers.load(Ordering::Relaxed)
    }

    /// The frontend can only serve queries while at least one querier is
    /// connected; a downstream proxy needs none.
    pub fn check_ready(&self, downstream_mode: bool) -> std::result::Result<(), String> {
        if downstream_mode || self.connected_workers() > 0 {
            return Ok(());
        }
        Err("not ready: number of queriers connected to query-frontend is 0".to_string())
    }

    #[cfg(test)]
    fn force_connected(&self, count: usize) {
        self.connected_workers.store(count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_queue::FixedLimits;
    use quill_wire::HttpRequest;

    fn frontend() -> Frontend {
        Frontend::new(Arc::new(QueueSet::new(4, FixedLimits(0))))
    }

    #[tokio::test]
    async fn register_then_deliver_resolves_the_handler() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let response_rx = frontend.register(query_id);
        assert!(frontend.deliver(query_id, Ok(HttpResponse::new(200, "ok".into()))));
        let result = response_rx.await.expect("delivery").expect("response");
        assert_eq!(result.status, 200);
    }

    #[test]
    fn stray_results_are_dropped() {
        let frontend = frontend();
        assert!(!frontend.deliver(12345, Ok(HttpResponse::new(200, "late".into()))));
    }

    #[test]
    fn second_delivery_is_dropped() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        assert!(frontend.deliver(query_id, Ok(HttpResponse::new(200, "first".into()))));
        assert!(!frontend.deliver(query_id, Ok(HttpResponse::new(200, "dup".into()))));
    }

    #[test]
    fn enqueue_failure_removes_the_pending_entry() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        let envelope = Envelope::new(query_id, "", HttpRequest::default());
        let err = frontend.enqueue(envelope).expect_err("no tenant");
        assert!(matches!(err, QueryError::MissingTenant));
        // The entry is gone: a later result for the id is a stray.
        assert!(!frontend.deliver(query_id, Ok(HttpResponse::new(200, "x".into()))));
    }

    #[tokio::test]
    async fn cancel_reaches_the_dispatched_stream() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        let (writer, mut outgoing) = mpsc::channel(4);
        assert!(frontend.mark_dispatched(query_id, writer));
        frontend.cancel(query_id);
        match outgoing.recv().await {
            Some(Message::Cancel { query_id: id }) => assert_eq!(id, query_id),
            other => panic!("expected cancel, got {other:?}"),
        }
        // Cancellation removed the entry; the querier's eventual reply
        // is dropped as a late result.
        assert!(!frontend.deliver(query_id, Ok(HttpResponse::new(200, "late".into()))));
    }

    #[test]
    fn dispatch_is_skipped_for_cancelled_queries() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        frontend.cancel(query_id);
        let (writer, _outgoing) = mpsc::channel(1);
        assert!(!frontend.mark_dispatched(query_id, writer));
    }

    #[test]
    fn lost_workers_flag_their_queries() {
        let frontend = frontend();
        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        let (writer, _outgoing) = mpsc::channel(1);
        assert!(frontend.mark_dispatched(query_id, writer));
        frontend.mark_worker_lost(&[query_id]);
        assert_eq!(frontend.take_expired(query_id), Some(true));
        // Removed exactly once.
        assert_eq!(frontend.take_expired(query_id), None);
    }

    #[test]
    fn readiness_requires_a_querier_unless_proxying() {
        let frontend = frontend();
        frontend.force_connected(3);
        assert!(frontend.check_ready(false).is_ok());

        frontend.force_connected(0);
        let err = frontend.check_ready(false).expect_err("no queriers");
        assert_eq!(
            err,
            "not ready: number of queriers connected to query-frontend is 0"
        );
        assert!(frontend.check_ready(true).is_ok());
    }
}
