//! Event Bus
//!
//! Typed publish/subscribe with one delivery worker thread per subscription.
//!
//! # Delivery Guarantees
//! - Each subscription owns a private FIFO queue; delivery within one
//!   subscription is strictly in publish order.
//! - Publishing never waits for consumers: a slow callback only delays its
//!   own subscription.
//! - Shutdown is graceful: every worker drains its queue before exiting.
//! - A panicking callback is caught at the subscription boundary, logged and
//!   counted; the worker keeps delivering.

use crate::replay::events::MessageQueue;
use crate::replay::quiescence::InFlightCounter;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Subscriber callback. Runs on the subscription's own worker thread.
pub type EventCallback<M> = Box<dyn FnMut(&M) + Send + 'static>;

/// Errors returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus has been shut down.
    ShutDown,
    /// The delivery worker thread could not be spawned.
    SpawnFailed(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "event bus is shut down"),
            Self::SpawnFailed(reason) => write!(f, "failed to spawn delivery worker: {}", reason),
        }
    }
}

impl std::error::Error for BusError {}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

struct QueueState<M> {
    events: VecDeque<M>,
    processing: bool,
    stopping: bool,
}

struct Subscription<M: MessageQueue> {
    id: u64,
    queue: Mutex<QueueState<M>>,
    ready: Condvar,
    delivered: AtomicU64,
    failed: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M: MessageQueue> Subscription<M> {
    fn new(id: u64) -> Self {
        Self {
            id,
            queue: Mutex::new(QueueState {
                events: VecDeque::new(),
                processing: false,
                stopping: false,
            }),
            ready: Condvar::new(),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Enqueue one envelope. Refused once the worker has been told to stop.
    ///
    /// The event is counted before the queue lock is taken, so the worker
    /// can never finish it before it is counted.
    fn push(&self, event: M, in_flight: Option<&InFlightCounter>) -> bool {
        if let Some(counter) = in_flight {
            counter.add_one();
        }
        {
            let mut queue = self.queue.lock();
            if !queue.stopping {
                queue.events.push_back(event);
                self.ready.notify_one();
                return true;
            }
        }
        if let Some(counter) = in_flight {
            counter.remove_one();
        }
        false
    }

    fn run(&self, mut callback: EventCallback<M>, in_flight: Option<Arc<InFlightCounter>>) {
        loop {
            let event = {
                let mut queue = self.queue.lock();
                queue.processing = false;
                while queue.events.is_empty() && !queue.stopping {
                    self.ready.wait(&mut queue);
                }
                match queue.events.pop_front() {
                    Some(event) => {
                        queue.processing = true;
                        event
                    }
                    // Stopping and fully drained.
                    None => break,
                }
            };

            let kind = event.kind();
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(()) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        mq = M::NAME,
                        subscription = self.id,
                        kind = %kind,
                        panic = %panic_message(payload.as_ref()),
                        "subscriber callback panicked"
                    );
                }
            }

            if let Some(counter) = &in_flight {
                counter.remove_one();
            }
        }
        debug!(mq = M::NAME, subscription = self.id, "delivery worker finished");
    }

    fn request_stop(&self) {
        let mut queue = self.queue.lock();
        queue.stopping = true;
        self.ready.notify_all();
    }

    fn join(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Shutdown requested from this subscription's own callback;
            // the loop exits once the queue is drained.
            warn!(mq = M::NAME, subscription = self.id, "shutdown from own callback, not joining");
            return;
        }
        if handle.join().is_err() {
            error!(mq = M::NAME, subscription = self.id, "delivery worker terminated abnormally");
        }
    }

    fn is_working(&self) -> bool {
        let queue = self.queue.lock();
        !queue.events.is_empty() || queue.processing
    }

    fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle to one live subscription.
pub struct SubscriptionHandle<M: MessageQueue> {
    sub: Arc<Subscription<M>>,
}

impl<M: MessageQueue> SubscriptionHandle<M> {
    pub fn id(&self) -> u64 {
        self.sub.id
    }

    /// Callbacks that returned normally.
    pub fn delivered(&self) -> u64 {
        self.sub.delivered.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked.
    pub fn failed(&self) -> u64 {
        self.sub.failed.load(Ordering::Relaxed)
    }

    /// Envelopes queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.sub.pending()
    }

    /// True while envelopes are queued or a callback is running.
    pub fn is_working(&self) -> bool {
        self.sub.is_working()
    }
}

impl<M: MessageQueue> fmt::Debug for SubscriptionHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("mq", &M::NAME)
            .field("id", &self.id())
            .field("delivered", &self.delivered())
            .field("failed", &self.failed())
            .field("pending", &self.pending())
            .finish()
    }
}

// =============================================================================
// BUS
// =============================================================================

struct BusInner<M: MessageQueue> {
    subscriptions: RwLock<Vec<Arc<Subscription<M>>>>,
    stopped: AtomicBool,
    next_id: AtomicU64,
    in_flight: Option<Arc<InFlightCounter>>,
    worker_prefix: String,
}

impl<M: MessageQueue> BusInner<M> {
    fn publish(&self, event: M) -> usize {
        if self.stopped.load(Ordering::Acquire) {
            return 0;
        }
        let subscriptions: Vec<_> = self.subscriptions.read().iter().cloned().collect();
        let mut queued = 0;
        for sub in &subscriptions {
            if sub.push(event.clone(), self.in_flight.as_deref()) {
                queued += 1;
            }
        }
        queued
    }
}

/// Publish/subscribe hub for one message-queue family.
///
/// Dropping the bus shuts it down (draining every subscription).
pub struct EventBus<M: MessageQueue> {
    inner: Arc<BusInner<M>>,
}

impl<M: MessageQueue> EventBus<M> {
    pub fn new() -> Self {
        Self::build(None, "bus")
    }

    /// Bus whose queued-or-delivering envelopes are reported to `counter`.
    pub fn with_in_flight(counter: Arc<InFlightCounter>) -> Self {
        Self::build(Some(counter), "bus")
    }

    fn build(in_flight: Option<Arc<InFlightCounter>>, worker_prefix: &str) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: RwLock::new(Vec::new()),
                stopped: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                in_flight,
                worker_prefix: worker_prefix.to_string(),
            }),
        }
    }

    /// Name delivery threads `<prefix>-<family>-<id>`.
    pub fn with_worker_prefix(mut self, prefix: &str) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.worker_prefix = prefix.to_string();
        }
        self
    }

    /// Start a dedicated delivery worker for `callback`.
    pub fn subscribe<F>(&self, callback: F) -> Result<SubscriptionHandle<M>, BusError>
    where
        F: FnMut(&M) + Send + 'static,
    {
        let mut subscriptions = self.inner.subscriptions.write();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(BusError::ShutDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription::new(id));
        let worker_sub = Arc::clone(&sub);
        let in_flight = self.inner.in_flight.clone();
        let callback: EventCallback<M> = Box::new(callback);

        let handle = thread::Builder::new()
            .name(format!("{}-{}-{}", self.inner.worker_prefix, M::NAME, id))
            .spawn(move || worker_sub.run(callback, in_flight))
            .map_err(|e| BusError::SpawnFailed(e.to_string()))?;
        *sub.worker.lock() = Some(handle);

        debug!(mq = M::NAME, subscription = id, "delivery worker started");
        subscriptions.push(Arc::clone(&sub));
        Ok(SubscriptionHandle { sub })
    }

    /// Copy `event` into every live subscription's queue.
    ///
    /// Returns the number of subscriptions it was queued for; 0 after
    /// shutdown.
    pub fn publish(&self, event: M) -> usize {
        self.inner.publish(event)
    }

    /// Cheap producer handle that does not keep the bus alive.
    pub fn publisher(&self) -> Publisher<M> {
        Publisher {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop one subscription after draining its queue.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle<M>) -> bool {
        let removed = {
            let mut subscriptions = self.inner.subscriptions.write();
            let before = subscriptions.len();
            subscriptions.retain(|s| s.id != handle.id());
            before != subscriptions.len()
        };
        if removed {
            handle.sub.request_stop();
            handle.sub.join();
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Poll until no subscription has queued or running work.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_until_idle(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = self
                .inner
                .subscriptions
                .read()
                .iter()
                .any(|s| s.is_working());
            if !busy {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(poll);
        }
    }

    /// Refuse new events, let every worker drain its queue, and join them.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(mq = M::NAME, "Stopping delivery workers...");

        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.write());
        for sub in &subscriptions {
            sub.request_stop();
        }
        for sub in &subscriptions {
            sub.join();
        }
        info!(mq = M::NAME, workers = subscriptions.len(), "Stopping delivery workers finished");
    }
}

impl<M: MessageQueue> Default for EventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MessageQueue> Drop for EventBus<M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<M: MessageQueue> fmt::Debug for EventBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("mq", &M::NAME)
            .field("subscriptions", &self.subscription_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Producer-side handle to a bus.
pub struct Publisher<M: MessageQueue> {
    inner: Weak<BusInner<M>>,
}

impl<M: MessageQueue> Publisher<M> {
    /// Publish through the bus if it still exists.
    ///
    /// Returns false when the bus has been dropped.
    pub fn publish(&self, event: M) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                inner.publish(event);
                true
            }
            None => {
                error!(mq = M::NAME, "Event bus not available");
                false
            }
        }
    }
}

impl<M: MessageQueue> Clone for Publisher<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: MessageQueue> fmt::Debug for Publisher<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("mq", &M::NAME)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::events::{
        AnalyzerStreamEvent, MarketStreamEvent, MarketStreamKind, OrderPlanInfo, Trade,
    };
    use crate::replay::quiescence::{QuiescenceRegistry, UnitId};

    fn trade(n: u64) -> MarketStreamEvent {
        MarketStreamEvent::NewTrade(Trade {
            price: n as f64,
            quantity: 1.0,
            received_timestamp: n,
            ..Default::default()
        })
    }

    fn collector() -> (Arc<Mutex<Vec<u64>>>, impl FnMut(&MarketStreamEvent) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |event: &MarketStreamEvent| {
            sink.lock().push(event.received_timestamp())
        })
    }

    #[test]
    fn test_each_subscription_sees_publish_order() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let collectors: Vec<_> = (0..3)
            .map(|_| {
                let (seen, cb) = collector();
                let handle = bus.subscribe(cb).unwrap();
                (seen, handle)
            })
            .collect();

        for n in 0..500 {
            assert_eq!(bus.publish(trade(n)), 3);
        }
        bus.shutdown();

        let expected: Vec<u64> = (0..500).collect();
        for (seen, handle) in &collectors {
            assert_eq!(*seen.lock(), expected);
            assert_eq!(handle.delivered(), 500);
        }
    }

    #[test]
    fn test_shutdown_drains_queued_events() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let (seen, mut cb) = collector();
        bus.subscribe(move |event: &MarketStreamEvent| {
            thread::sleep(Duration::from_millis(5));
            cb(event);
        })
        .unwrap();

        for n in 0..20 {
            bus.publish(trade(n));
        }
        bus.shutdown();

        assert_eq!(seen.lock().len(), 20);
        assert_eq!(bus.publish(trade(99)), 0);
        assert_eq!(seen.lock().len(), 20);
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let (slow_seen, mut slow_cb) = collector();
        let (fast_seen, fast_cb) = collector();
        bus.subscribe(move |event: &MarketStreamEvent| {
            thread::sleep(Duration::from_millis(100));
            slow_cb(event);
        })
        .unwrap();
        bus.subscribe(fast_cb).unwrap();

        let start = Instant::now();
        for n in 0..5 {
            bus.publish(trade(n));
        }
        assert!(start.elapsed() < Duration::from_millis(50));

        for _ in 0..100 {
            if fast_seen.lock().len() == 5 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fast_seen.lock().len(), 5);
        assert!(slow_seen.lock().len() < 5);

        bus.shutdown();
        assert_eq!(slow_seen.lock().len(), 5);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let (faulty_seen, mut faulty_cb) = collector();
        let (healthy_seen, healthy_cb) = collector();
        let faulty = bus
            .subscribe(move |event: &MarketStreamEvent| {
                if event.received_timestamp() == 3 {
                    panic!("bad event");
                }
                faulty_cb(event);
            })
            .unwrap();
        let healthy = bus.subscribe(healthy_cb).unwrap();

        for n in 0..6 {
            bus.publish(trade(n));
        }
        bus.shutdown();

        assert_eq!(*faulty_seen.lock(), vec![0, 1, 2, 4, 5]);
        assert_eq!(faulty.failed(), 1);
        assert_eq!(faulty.delivered(), 5);
        assert_eq!(*healthy_seen.lock(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(healthy.failed(), 0);
    }

    #[test]
    fn test_in_flight_reports_transport_busy() {
        let registry = Arc::new(QuiescenceRegistry::new());
        let counter = Arc::new(InFlightCounter::new(registry.unit(UnitId::Transport)));
        let bus = EventBus::<MarketStreamEvent>::with_in_flight(counter.clone());

        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let worker_gate = gate.clone();
        bus.subscribe(move |_: &MarketStreamEvent| {
            let _pass = worker_gate.lock();
        })
        .unwrap();

        bus.publish(trade(1));
        bus.publish(trade(2));
        assert!(registry.busy_units().contains(UnitId::Transport));
        assert_eq!(counter.in_flight(), 2);

        drop(held);
        assert!(bus.wait_until_idle(Duration::from_secs(2), Duration::from_millis(5)));
        assert!(registry.is_idle());
        assert_eq!(counter.in_flight(), 0);
    }

    #[test]
    fn test_publisher_outliving_bus() {
        let bus = EventBus::<AnalyzerStreamEvent>::new();
        let publisher = bus.publisher();
        let plans = Arc::new(Mutex::new(Vec::new()));
        let sink = plans.clone();
        bus.subscribe(move |event: &AnalyzerStreamEvent| match event {
            AnalyzerStreamEvent::NewOrderPlan(plan) => sink.lock().push(plan.clone()),
        })
        .unwrap();

        assert!(publisher.publish(AnalyzerStreamEvent::NewOrderPlan(OrderPlanInfo {
            quantity: 2.0,
            ..Default::default()
        })));
        drop(bus);

        assert_eq!(plans.lock().len(), 1);
        assert!(!publisher.publish(AnalyzerStreamEvent::NewOrderPlan(OrderPlanInfo::default())));
    }

    #[test]
    fn test_unsubscribe_drains_and_stops_one_subscription() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let (first_seen, first_cb) = collector();
        let (second_seen, second_cb) = collector();
        let first = bus.subscribe(first_cb).unwrap();
        bus.subscribe(second_cb).unwrap();

        bus.publish(trade(1));
        assert!(bus.unsubscribe(&first));
        assert!(!bus.unsubscribe(&first));
        bus.publish(trade(2));
        bus.shutdown();

        assert_eq!(*first_seen.lock(), vec![1]);
        assert_eq!(*second_seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_subscribe_after_shutdown_fails() {
        let bus = EventBus::<MarketStreamEvent>::new();
        bus.shutdown();
        bus.shutdown();
        let err = bus.subscribe(|_: &MarketStreamEvent| {}).unwrap_err();
        assert_eq!(err, BusError::ShutDown);
    }

    #[test]
    fn test_callback_sees_exhaustive_kinds() {
        let bus = EventBus::<MarketStreamEvent>::new();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        bus.subscribe(move |event: &MarketStreamEvent| sink.lock().push(event.kind()))
            .unwrap();

        bus.publish(MarketStreamEvent::OrderBookUpdate(Default::default()));
        bus.publish(trade(1));
        bus.shutdown();

        assert_eq!(
            *kinds.lock(),
            vec![MarketStreamKind::OrderBookUpdate, MarketStreamKind::NewTrade]
        );
    }
}
