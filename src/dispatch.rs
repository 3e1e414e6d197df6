//! Activation dispatcher: watches the store and activates consumers.
//!
//! The dispatcher runs on a background thread, decoupled from the
//! producer's transaction. Whenever entries are available it ensures
//! consumers are running, bounded by `max_concurrency`; each activated
//! consumer drains the queue and exits on an empty poll. Activation
//! failures are retried with backoff and never drop messages; they stay
//! safely queued in the store.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::consumer::{Consumer, ProcessOutcome};
use crate::sink::Sink;
use crate::store::QueueStore;

/// Statistics from a dispatcher run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub polls: usize,
    /// Consumer activations (threads started).
    pub activations: usize,
    /// Activation attempts that failed and were retried with backoff.
    pub spawn_retries: usize,
    pub delivered: usize,
    pub abandoned: usize,
    pub dead_lettered: usize,
}

/// Dispatcher tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct DispatcherConfig {
    max_concurrency: usize,
    poll_interval: Duration,
    spawn_backoff: Duration,
    spawn_backoff_cap: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            max_concurrency: 1,
            poll_interval: Duration::from_millis(50),
            spawn_backoff: Duration::from_millis(10),
            spawn_backoff_cap: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on concurrently running consumers (backpressure toward the
    /// sink).
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_spawn_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.spawn_backoff = base;
        self.spawn_backoff_cap = cap;
        self
    }
}

struct Shared {
    active: AtomicUsize,
    alive: AtomicBool,
    draining: AtomicBool,
    stats: Mutex<DispatcherStats>,
}

impl Shared {
    fn record(&self, outcome: &ProcessOutcome) {
        if let Ok(mut stats) = self.stats.lock() {
            match outcome {
                ProcessOutcome::Empty => {}
                ProcessOutcome::Delivered(_) => stats.delivered += 1,
                ProcessOutcome::Abandoned(_) => stats.abandoned += 1,
                ProcessOutcome::DeadLettered(_) => stats.dead_lettered += 1,
            }
        }
    }
}

/// Cloneable probe into a running dispatcher, for liveness checks and
/// remote stop.
#[derive(Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
    stop_tx: Sender<()>,
}

impl DispatcherHandle {
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::SeqCst)
    }

    pub fn active_consumers(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Ask the dispatcher to drain and stop.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// A background thread that activates consumers while entries are
/// available.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use dialog_rust::{
///     BufferSink, ChangeEvent, Consumer, Dispatcher, Enqueuer, MemoryQueueStore,
/// };
///
/// let store = MemoryQueueStore::new();
/// let sink = BufferSink::new();
///
/// let dispatcher = {
///     let sink = sink.clone();
///     Dispatcher::spawn(store.clone(), move || Consumer::new(sink.clone()))
/// };
///
/// let enqueuer = Enqueuer::new();
/// let mut txn = enqueuer.begin(&store);
/// txn.enqueue(&ChangeEvent::new("C1", "Alice", "1 Main St", "a@example.com")).unwrap();
/// txn.commit().unwrap();
///
/// while sink.delivered_count() == 0 {
///     std::thread::sleep(Duration::from_millis(5));
/// }
///
/// let stats = dispatcher.stop();
/// assert_eq!(stats.delivered, 1);
/// ```
pub struct Dispatcher {
    stop_tx: Sender<()>,
    watcher: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// Spawn a dispatcher with default configuration.
    ///
    /// `make_consumer` is called once per activation, so each concurrent
    /// consumer gets its own sink instance. The store must be `Clone`:
    /// cloning creates another handle to the same storage.
    pub fn spawn<Q, S, F>(store: Q, make_consumer: F) -> Self
    where
        Q: QueueStore + Clone + Send + Sync + 'static,
        S: Sink + Send + 'static,
        F: Fn() -> Consumer<S> + Send + 'static,
    {
        Self::spawn_with(store, make_consumer, DispatcherConfig::default())
    }

    pub fn spawn_with<Q, S, F>(store: Q, make_consumer: F, config: DispatcherConfig) -> Self
    where
        Q: QueueStore + Clone + Send + Sync + 'static,
        S: Sink + Send + 'static,
        F: Fn() -> Consumer<S> + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel();
        let shared = Arc::new(Shared {
            active: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            stats: Mutex::new(DispatcherStats::default()),
        });

        let watcher = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let mut workers: Vec<JoinHandle<()>> = Vec::new();
                let mut backoff = config.spawn_backoff;
                let mut activation = 0usize;

                'watch: loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }

                    if let Ok(mut stats) = shared.stats.lock() {
                        stats.polls += 1;
                    }
                    workers.retain(|w| !w.is_finished());

                    let available = match store.depth() {
                        Ok(depth) => depth.available,
                        Err(e) => {
                            warn!(error = %e, "store depth check failed");
                            0
                        }
                    };

                    let mut pending = available;
                    while pending > 0
                        && shared.active.load(Ordering::SeqCst) < config.max_concurrency
                    {
                        shared.active.fetch_add(1, Ordering::SeqCst);
                        activation += 1;
                        let worker = consumer_worker(
                            store.clone(),
                            make_consumer(),
                            Arc::clone(&shared),
                        );
                        let spawned = thread::Builder::new()
                            .name(format!("dialog-consumer-{}", activation))
                            .spawn(worker);
                        match spawned {
                            Ok(handle) => {
                                debug!(activation, "consumer activated");
                                workers.push(handle);
                                if let Ok(mut stats) = shared.stats.lock() {
                                    stats.activations += 1;
                                }
                                backoff = config.spawn_backoff;
                                pending -= 1;
                            }
                            Err(e) => {
                                shared.active.fetch_sub(1, Ordering::SeqCst);
                                if let Ok(mut stats) = shared.stats.lock() {
                                    stats.spawn_retries += 1;
                                }
                                warn!(
                                    error = %e,
                                    backoff_ms = backoff.as_millis() as u64,
                                    "consumer activation failed, backing off"
                                );
                                // Messages stay safely queued; retry after
                                // the backoff unless asked to stop.
                                match stop_rx.recv_timeout(backoff) {
                                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break 'watch,
                                    Err(RecvTimeoutError::Timeout) => {}
                                }
                                backoff = (backoff * 2).min(config.spawn_backoff_cap);
                                continue 'watch;
                            }
                        }
                    }

                    match stop_rx.recv_timeout(config.poll_interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }

                // Graceful drain: let in-flight consumers finish their
                // current entry, then join them.
                shared.draining.store(true, Ordering::SeqCst);
                info!(in_flight = workers.len(), "dispatcher draining");
                for worker in workers {
                    let _ = worker.join();
                }
                shared.alive.store(false, Ordering::SeqCst);
            })
        };

        Dispatcher {
            stop_tx,
            watcher: Some(watcher),
            shared,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Signal the dispatcher to stop, wait for the drain to finish, and
    /// return the run's statistics.
    pub fn stop(mut self) -> DispatcherStats {
        let _ = self.stop_tx.send(());
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
        self.shared.stats.lock().map(|s| *s).unwrap_or_default()
    }

    /// Signal the dispatcher to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        // Don't join on drop - let the watcher finish naturally.
    }
}

fn consumer_worker<Q, S>(
    store: Q,
    mut consumer: Consumer<S>,
    shared: Arc<Shared>,
) -> impl FnOnce()
where
    Q: QueueStore + Send + 'static,
    S: Sink + Send + 'static,
{
    move || {
        loop {
            if shared.draining.load(Ordering::SeqCst) {
                break;
            }
            match consumer.process_one(&store) {
                Ok(ProcessOutcome::Empty) => break,
                Ok(outcome) => shared.record(&outcome),
                Err(e) => {
                    warn!(error = %e, "consumer stopped on store error");
                    break;
                }
            }
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::ChangeEvent;
    use crate::enqueue::Enqueuer;
    use crate::sink::{BufferSink, Sink};
    use crate::store::MemoryQueueStore;
    use std::time::Instant;

    fn enqueue_customers(store: &MemoryQueueStore, count: usize) {
        let enqueuer = Enqueuer::new();
        let mut txn = enqueuer.begin(store);
        for i in 0..count {
            txn.enqueue(&ChangeEvent::new(
                format!("C{}", i),
                format!("Customer {}", i),
                "1 Main St",
                "c@example.com",
            ))
            .unwrap();
        }
        txn.commit().unwrap();
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_enqueued_messages() {
        let store = MemoryQueueStore::new();
        let sink = BufferSink::new();

        let dispatcher = {
            let sink = sink.clone();
            Dispatcher::spawn(store.clone(), move || {
                Consumer::new(sink.clone()).with_receive_timeout(Duration::from_millis(10))
            })
        };

        enqueue_customers(&store, 3);
        wait_for(Duration::from_secs(5), || sink.delivered_count() == 3);

        let handle = dispatcher.handle();
        let stats = dispatcher.stop();
        assert_eq!(stats.delivered, 3);
        assert!(stats.activations >= 1);
        assert!(!handle.is_alive());
    }

    #[test]
    fn handle_reports_liveness() {
        let store = MemoryQueueStore::new();
        let dispatcher = Dispatcher::spawn(store, || {
            Consumer::new(BufferSink::new()).with_receive_timeout(Duration::from_millis(10))
        });
        let handle = dispatcher.handle();

        assert!(handle.is_alive());
        handle.signal_stop();
        wait_for(Duration::from_secs(5), || !handle.is_alive());
    }

    struct SlowSink {
        inner: BufferSink,
        in_flight: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    impl Sink for SlowSink {
        type Error = String;

        fn deliver(&mut self, record: &ChangeEvent) -> Result<(), Self::Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.deliver(record).map_err(|e| e.to_string())
        }
    }

    #[test]
    fn concurrency_stays_bounded() {
        let store = MemoryQueueStore::new();
        let sink = BufferSink::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let dispatcher = {
            let sink = sink.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            Dispatcher::spawn_with(
                store.clone(),
                move || {
                    Consumer::new(SlowSink {
                        inner: sink.clone(),
                        in_flight: Arc::clone(&in_flight),
                        max_seen: Arc::clone(&max_seen),
                    })
                    .with_receive_timeout(Duration::from_millis(10))
                },
                DispatcherConfig::new()
                    .with_max_concurrency(2)
                    .with_poll_interval(Duration::from_millis(10)),
            )
        };

        enqueue_customers(&store, 6);
        wait_for(Duration::from_secs(10), || sink.delivered_count() == 6);
        dispatcher.stop();

        let max = max_seen.load(Ordering::SeqCst);
        assert!(max <= 2, "saw {} concurrent deliveries", max);
        assert!(max >= 1);
    }

    #[test]
    fn stop_drains_the_current_entry() {
        let store = MemoryQueueStore::new();
        let sink = BufferSink::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let dispatcher = {
            let sink = sink.clone();
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            Dispatcher::spawn_with(
                store.clone(),
                move || {
                    Consumer::new(SlowSink {
                        inner: sink.clone(),
                        in_flight: Arc::clone(&in_flight),
                        max_seen: Arc::clone(&max_seen),
                    })
                    .with_receive_timeout(Duration::from_millis(10))
                },
                DispatcherConfig::new().with_poll_interval(Duration::from_millis(5)),
            )
        };

        enqueue_customers(&store, 1);
        wait_for(Duration::from_secs(5), || in_flight.load(Ordering::SeqCst) == 1);

        // Stop while the sink is mid-delivery: the entry must complete.
        let stats = dispatcher.stop();
        assert_eq!(stats.delivered, 1);
        assert_eq!(sink.delivered_count(), 1);
        assert_eq!(store.depth().unwrap().in_flight, 0);
    }
}
