//! End-to-end pipeline: transactional enqueue → dispatcher activation →
//! consumer delivery → conversation close.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dialog_rust::{
    BufferSink, ChangeEvent, Consumer, ConversationState, Dispatcher, Enqueuer, FileSink,
    MemoryQueueStore, ProcessOutcome, QueueStore, Sink,
};

fn alice() -> ChangeEvent {
    ChangeEvent::new("C1", "Alice", "1 Main St", "a@example.com")
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn inserted_customer_reaches_the_sink_exactly_once() {
    let store = MemoryQueueStore::new();
    let sink = BufferSink::new();

    let dispatcher = {
        let sink = sink.clone();
        Dispatcher::spawn(store.clone(), move || {
            Consumer::new(sink.clone()).with_receive_timeout(Duration::from_millis(10))
        })
    };

    let enqueuer = Enqueuer::new();
    let mut txn = enqueuer.begin(&store);
    let handle = txn.enqueue(&alice()).unwrap();
    txn.commit().unwrap();

    wait_for(Duration::from_secs(5), || sink.delivered_count() == 1);
    wait_for(Duration::from_secs(5), || {
        store.conversation_state(handle).unwrap() == Some(ConversationState::Closed)
    });

    let stats = dispatcher.stop();
    assert_eq!(stats.delivered, 1);
    assert_eq!(sink.delivered(), vec![alice()]);
    assert_eq!(store.depth().unwrap().available, 0);
}

/// Fails the first `failures` deliveries, then delegates to a buffer.
/// Counts every call, successful or not.
struct FlakySink {
    failures_left: u32,
    calls: Arc<AtomicUsize>,
    inner: BufferSink,
}

impl Sink for FlakySink {
    type Error = String;

    fn deliver(&mut self, record: &ChangeEvent) -> Result<(), Self::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err("transient sink failure".to_string());
        }
        self.inner.deliver(record).map_err(|e| e.to_string())
    }
}

#[test]
fn flaky_sink_is_retried_and_the_conversation_still_closes_once() {
    let store = MemoryQueueStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let captured = BufferSink::new();

    let mut consumer = Consumer::new(FlakySink {
        failures_left: 1,
        calls: Arc::clone(&calls),
        inner: captured.clone(),
    })
    .with_receive_timeout(Duration::from_millis(10));

    let enqueuer = Enqueuer::new();
    let mut txn = enqueuer.begin(&store);
    let handle = txn.enqueue(&alice()).unwrap();
    txn.commit().unwrap();

    assert_eq!(
        consumer.process_one(&store).unwrap(),
        ProcessOutcome::Abandoned(handle)
    );
    assert_eq!(
        consumer.process_one(&store).unwrap(),
        ProcessOutcome::Delivered(handle)
    );
    assert_eq!(consumer.process_one(&store).unwrap(), ProcessOutcome::Empty);

    // Exactly two deliver calls, exactly one closed conversation.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(captured.delivered(), vec![alice()]);
    assert_eq!(
        store.conversation_state(handle).unwrap(),
        Some(ConversationState::Closed)
    );
}

#[test]
fn rolled_back_transaction_notifies_nobody() {
    let store = MemoryQueueStore::new();
    let enqueuer = Enqueuer::new();

    {
        let mut txn = enqueuer.begin(&store);
        txn.enqueue(&alice()).unwrap();
        txn.rollback();
    }

    let sink = BufferSink::new();
    let mut consumer =
        Consumer::new(sink.clone()).with_receive_timeout(Duration::from_millis(10));
    assert_eq!(consumer.process_one(&store).unwrap(), ProcessOutcome::Empty);
    assert_eq!(sink.delivered_count(), 0);
}

#[test]
fn invalid_event_fails_the_whole_write() {
    let store = MemoryQueueStore::new();
    let enqueuer = Enqueuer::new();

    let mut txn = enqueuer.begin(&store);
    txn.enqueue(&alice()).unwrap();
    let mut bad = alice();
    bad.email_address = String::new();
    assert!(txn.enqueue(&bad).is_err());
    assert!(txn.commit().is_err());

    assert_eq!(store.depth().unwrap().available, 0);
}

#[test]
fn file_sink_writes_the_customer_block() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("InsertedCustomers.txt");

    let store = MemoryQueueStore::new();
    let mut consumer = Consumer::new(FileSink::new(&path))
        .with_receive_timeout(Duration::from_millis(10));

    let enqueuer = Enqueuer::new();
    let mut txn = enqueuer.begin(&store);
    txn.enqueue(&alice()).unwrap();
    txn.commit().unwrap();

    assert!(matches!(
        consumer.process_one(&store).unwrap(),
        ProcessOutcome::Delivered(_)
    ));

    let contents = std::fs::read_to_string(&path).unwrap();
    let expected = "New Customer arrived:\n\
                    =====================\n\
                    CustomerNumber: C1\n\
                    CustomerName: Alice\n\
                    CustomerAddress: 1 Main St\n\
                    EmailAddress: a@example.com\n";
    assert_eq!(contents, expected);
}

#[test]
fn escaped_characters_survive_the_full_pipeline() {
    let store = MemoryQueueStore::new();
    let event = ChangeEvent::new("C7", "Smith & Sons", "3 Oak St <rear>", "s@example.com");

    let enqueuer = Enqueuer::new();
    let mut txn = enqueuer.begin(&store);
    txn.enqueue(&event).unwrap();
    txn.commit().unwrap();

    let sink = BufferSink::new();
    let mut consumer =
        Consumer::new(sink.clone()).with_receive_timeout(Duration::from_millis(10));
    assert!(matches!(
        consumer.process_one(&store).unwrap(),
        ProcessOutcome::Delivered(_)
    ));
    assert_eq!(sink.delivered(), vec![event]);
}
