//! # Request Controller
//!
//! Hand-off point between the network tasks and application logic.
//!
//! Readers turn decoded messages into [`Request`]s and push them into a bounded
//! [`RequestQueue`]; a fixed pool of worker tasks pops them and runs the handler the
//! application registered for the request's event. A full queue is reported to the
//! reader immediately instead of blocking it.
//!
//! Handlers are plain synchronous functions and may block. Each one runs on the
//! runtime's blocking pool, so a slow handler holds up its own worker and never the
//! readers, writers or timers. At most `worker_count` handlers run at once.
//!
//! ## Ordering
//! The queue stamps every accepted request with its own sequence number. With
//! priority ordering on, requests leave the queue by priority (highest first), then
//! creation time, then sequence number. With it off, the queue is strictly FIFO.
//!
//! ## Failure isolation
//! Handler errors and panics are caught per request and logged. A worker never dies
//! because of one request.
//!
//! ## Delivery
//! [`RequestController::deliver`] encodes a response once and queues one copy per
//! recipient. A recipient whose queue rejects the packet is reported and skipped; the
//! others still receive it.

use crate::core::codec::BinaryPacketEncoder;
use crate::core::packet::{Packet, SessionId};
use crate::error::{NetworkError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::request::{PrioritizedRequest, Request, RequestEvent, Response};
use crate::session::manager::SessionManager;
use crate::session::partition::{QueuePartitionManager, TicketQueue};
use crate::utils::metrics::NetworkStatistics;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Default bound of the request queue.
pub const DEFAULT_REQUEST_QUEUE_SIZE: usize = 50;
/// Default number of worker tasks.
pub const DEFAULT_WORKER_THREADS: usize = 5;

enum Pending {
    Prioritized(BinaryHeap<PrioritizedRequest>),
    Fifo(VecDeque<Request>),
}

impl Pending {
    fn len(&self) -> usize {
        match self {
            Pending::Prioritized(heap) => heap.len(),
            Pending::Fifo(queue) => queue.len(),
        }
    }

    fn push(&mut self, request: Request) {
        match self {
            Pending::Prioritized(heap) => heap.push(PrioritizedRequest(request)),
            Pending::Fifo(queue) => queue.push_back(request),
        }
    }

    fn pop(&mut self) -> Option<Request> {
        match self {
            Pending::Prioritized(heap) => heap.pop().map(|r| r.0),
            Pending::Fifo(queue) => queue.pop_front(),
        }
    }

    fn clear(&mut self) {
        match self {
            Pending::Prioritized(heap) => heap.clear(),
            Pending::Fifo(queue) => queue.clear(),
        }
    }
}

/// Bounded, optionally prioritized queue of requests awaiting a worker.
pub struct RequestQueue {
    pending: Mutex<Pending>,
    max_size: usize,
    notify: Notify,
    next_id: AtomicU64,
}

impl RequestQueue {
    pub fn new(max_size: usize, priority_ordering: bool) -> Self {
        let pending = if priority_ordering {
            Pending::Prioritized(BinaryHeap::with_capacity(max_size))
        } else {
            Pending::Fifo(VecDeque::with_capacity(max_size))
        };
        Self {
            pending: Mutex::new(pending),
            max_size,
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a request, or fail with [`NetworkError::RequestQueueFull`] at capacity.
    ///
    /// Accepted requests are stamped with this queue's next sequence number.
    pub fn enqueue_request(&self, request: Request) -> Result<()> {
        {
            let mut pending = self.pending.lock().map_err(|_| NetworkError::LockPoisoned)?;
            let size = pending.len();
            if size >= self.max_size {
                return Err(NetworkError::RequestQueueFull { size });
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            pending.push(request.with_id(id));
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_take(&self) -> Option<Request> {
        self.pending.lock().ok().and_then(|mut p| p.pop())
    }

    /// Wait for the next request in dispatch order.
    pub async fn next(&self) -> Request {
        loop {
            if let Some(request) = self.try_take() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    pub fn size(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_priority_ordering(&self) -> bool {
        self.pending
            .lock()
            .map(|p| matches!(*p, Pending::Prioritized(_)))
            .unwrap_or(false)
    }

    pub fn percentage_used(&self) -> f32 {
        if self.max_size == 0 {
            return 100.0;
        }
        self.size() as f32 * 100.0 / self.max_size as f32
    }

    pub fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("size", &self.size())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Outcome of delivering one response.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<SessionId>,
    pub rejected: Vec<(SessionId, NetworkError)>,
    pub missing: Vec<SessionId>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.missing.is_empty()
    }
}

/// What the controller needs to turn responses into queued packets.
pub struct Outbound {
    pub sessions: Arc<SessionManager>,
    pub encoder: BinaryPacketEncoder,
    pub writers: Arc<QueuePartitionManager<TicketQueue>>,
    pub statistics: Arc<NetworkStatistics>,
}

pub struct RequestController {
    name: String,
    queue: Arc<RequestQueue>,
    dispatcher: Dispatcher,
    outbound: Arc<Outbound>,
    worker_count: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl RequestController {
    pub fn new(
        name: impl Into<String>,
        queue: RequestQueue,
        worker_count: usize,
        dispatcher: Dispatcher,
        outbound: Outbound,
    ) -> Self {
        Self {
            name: name.into(),
            queue: Arc::new(queue),
            dispatcher,
            outbound: Arc::new(outbound),
            worker_count: worker_count.max(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn request_queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutdown.is_cancelled()
    }

    pub fn enqueue_request(&self, request: Request) -> Result<()> {
        self.queue.enqueue_request(request)
    }

    pub fn percentage_used_request_queue(&self) -> f32 {
        self.queue.percentage_used()
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in 0..self.worker_count {
            let queue = self.queue.clone();
            let dispatcher = self.dispatcher.clone();
            let outbound = self.outbound.clone();
            let shutdown = self.shutdown.clone();
            let name = self.name.clone();
            self.tracker.spawn(async move {
                run_worker(&name, worker, &queue, dispatcher, &outbound, shutdown).await;
            });
        }
        info!(controller = %self.name, workers = self.worker_count, "Request controller started");
    }

    /// Stop the workers, wait for in-flight requests and drop whatever is still queued.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        let dropped = self.queue.size();
        self.queue.clear();
        info!(controller = %self.name, dropped, "Request controller stopped");
    }

    /// Encode `response` once and queue it for every recipient.
    pub fn deliver(&self, response: Response) -> Result<DeliveryReport> {
        deliver(&self.outbound, response)
    }

    /// Run one request on the calling task.
    pub fn process(&self, request: &Request) -> Result<Option<DeliveryReport>> {
        match self.dispatcher.dispatch(request)? {
            Some(response) => deliver(&self.outbound, response).map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for RequestController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestController")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("queue", &self.queue)
            .finish()
    }
}

async fn run_worker(
    name: &str,
    worker: usize,
    queue: &RequestQueue,
    dispatcher: Dispatcher,
    outbound: &Outbound,
    shutdown: CancellationToken,
) {
    debug!(controller = name, worker, "Worker started");
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = queue.next() => request,
        };

        let job_dispatcher = dispatcher.clone();
        let job = tokio::task::spawn_blocking(move || {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| job_dispatcher.dispatch(&request)));
            (request, outcome)
        });
        let (request, outcome) = match job.await {
            Ok(finished) => finished,
            Err(e) => {
                error!(controller = name, worker, error = %e, "Request job did not complete");
                continue;
            }
        };

        match outcome {
            Ok(Ok(Some(response))) => match deliver(outbound, response) {
                Ok(report) if !report.is_complete() => debug!(
                    controller = name,
                    request = request.id(),
                    rejected = report.rejected.len(),
                    missing = report.missing.len(),
                    "Response partially delivered"
                ),
                Ok(_) => {}
                Err(e) => warn!(controller = name, request = request.id(), error = %e, "Response delivery failed"),
            },
            Ok(Ok(None)) => {}
            Ok(Err(NetworkError::UnhandledEvent(event))) => {
                debug!(controller = name, %event, "No handler for event");
            }
            Ok(Err(e)) => error!(
                controller = name,
                worker,
                request = request.id(),
                event = %request.event(),
                error = %e,
                "Request handler failed"
            ),
            Err(_) => error!(
                controller = name,
                worker,
                request = request.id(),
                event = %request.event(),
                "Request handler panicked"
            ),
        }
    }
    debug!(controller = name, worker, "Worker stopped");
}

pub(crate) fn deliver(outbound: &Outbound, response: Response) -> Result<DeliveryReport> {
    let content = response.content().to_bytes()?;
    let packet = Packet::new(content)
        .with_priority(response.priority())
        .with_encryption(response.is_encrypted())
        .with_transport(response.transport())
        .with_recipients(response.recipients().to_vec());
    let packet = outbound.encoder.encode(packet)?;

    let mut report = DeliveryReport::default();
    for &recipient in response.recipients() {
        let Some(session) = outbound.sessions.get(recipient) else {
            report.missing.push(recipient);
            continue;
        };
        match session.enqueue(packet.clone_for(recipient)) {
            Ok(()) => {
                report.delivered.push(recipient);
                if session.try_schedule() {
                    outbound
                        .writers
                        .queue_by_element_id(recipient as i64)
                        .push(recipient);
                }
            }
            Err(e) => {
                outbound.statistics.update_written_dropped_packets(1);
                report.rejected.push((recipient, e));
            }
        }
    }
    Ok(report)
}

/// Event queued for a session that is about to close.
pub(crate) fn closing_request(session: Arc<crate::session::Session>) -> Request {
    Request::new(RequestEvent::SessionWillBeClosed).with_sender(session)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::core::packet::PacketPriority;
    use crate::core::zero::ZeroMap;
    use crate::protocol::request::RequestPriority;
    use crate::security::filter::DefaultConnectionFilter;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn outbound() -> Outbound {
        let config = NetworkConfig::default();
        Outbound {
            sessions: Arc::new(SessionManager::new(
                &config,
                Arc::new(DefaultConnectionFilter::default()),
            )),
            encoder: BinaryPacketEncoder::new(),
            writers: Arc::new(QueuePartitionManager::new(2, TicketQueue::new).unwrap()),
            statistics: Arc::new(NetworkStatistics::new()),
        }
    }

    #[test]
    fn full_queue_reports_its_size() {
        let queue = RequestQueue::new(2, true);
        queue.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        queue.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        let err = queue
            .enqueue_request(Request::new(RequestEvent::SessionReadMessage))
            .unwrap_err();
        assert!(matches!(err, NetworkError::RequestQueueFull { size: 2 }));
        assert!((queue.percentage_used() - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn priority_queue_dispatch_order() {
        let queue = RequestQueue::new(10, true);
        let low = Request::new(RequestEvent::SessionReadMessage)
            .with_priority(RequestPriority::Low)
            .with_timestamp(0);
        let high_a = Request::new(RequestEvent::SessionReadMessage)
            .with_priority(RequestPriority::High)
            .with_timestamp(1);
        let high_b = Request::new(RequestEvent::SessionReadMessage)
            .with_priority(RequestPriority::High)
            .with_timestamp(2);

        queue.enqueue_request(low).unwrap();
        queue.enqueue_request(high_a).unwrap();
        queue.enqueue_request(high_b).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| queue.try_take().map(|r| r.id())).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn fifo_queue_ignores_priority() {
        let queue = RequestQueue::new(10, false);
        let first = Request::new(RequestEvent::SessionReadMessage).with_priority(RequestPriority::Lowest);
        let second = Request::new(RequestEvent::SessionReadMessage).with_priority(RequestPriority::Highest);
        queue.enqueue_request(first).unwrap();
        queue.enqueue_request(second).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| queue.try_take().map(|r| r.id())).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(!queue.is_priority_ordering());
    }

    #[test]
    fn each_queue_numbers_its_own_requests() {
        let a = RequestQueue::new(4, false);
        let b = RequestQueue::new(4, false);
        a.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        a.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        b.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();

        assert_eq!(a.try_take().unwrap().id(), 1);
        assert_eq!(a.try_take().unwrap().id(), 2);
        assert_eq!(b.try_take().unwrap().id(), 1);
    }

    #[test]
    fn rejected_request_does_not_consume_an_id() {
        let queue = RequestQueue::new(1, false);
        queue.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        assert!(queue.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).is_err());
        assert_eq!(queue.try_take().unwrap().id(), 1);
        queue.enqueue_request(Request::new(RequestEvent::SessionReadMessage)).unwrap();
        assert_eq!(queue.try_take().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn workers_survive_failing_and_panicking_handlers() {
        let dispatcher = Dispatcher::new();
        let handled = Arc::new(AtomicUsize::new(0));
        {
            let handled = handled.clone();
            dispatcher
                .register(RequestEvent::SessionReadMessage, move |request| {
                    handled.fetch_add(1, Ordering::SeqCst);
                    match request.attribute("mode") {
                        Some("panic") => panic!("handler blew up"),
                        Some("fail") => Err(NetworkError::Custom("bad request".into())),
                        _ => Ok(None),
                    }
                })
                .unwrap();
        }

        let controller = RequestController::new(
            "test",
            RequestQueue::new(16, true),
            1,
            dispatcher,
            outbound(),
        );
        controller.start();
        for mode in ["panic", "fail", "ok"] {
            controller
                .enqueue_request(
                    Request::new(RequestEvent::SessionReadMessage).with_attribute("mode", mode),
                )
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while handled.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(controller.is_running());
        controller.shutdown().await;
        assert!(!controller.is_running());
        assert_eq!(controller.request_queue().size(), 0);
    }

    #[test]
    fn delivery_reports_missing_recipients() {
        let outbound = outbound();
        let response = Response::new(ZeroMap::new())
            .to_all([41, 42])
            .with_priority(PacketPriority::Urgent);
        let report = deliver(&outbound, response).unwrap();
        assert_eq!(report.missing, vec![41, 42]);
        assert!(report.delivered.is_empty());
        assert!(!report.is_complete());
    }
}
