//! Event processors: the boundary between decision callers and the
//! dispatcher.
//!
//! [`BatchEventProcessor`] is the production processor: producers enqueue
//! non-blockingly onto a bounded channel and a dedicated consumer thread
//! accumulates batches, flushing on size, interval, explicit flush, or
//! shutdown. A full queue drops the event rather than blocking the caller.
use std::sync::mpsc::{RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::notifications::NotificationCenter;

use super::dispatcher::EventDispatcher;
use super::factory::EventFactory;
use super::UserEvent;

/// Consumer seam the façade hands user events to.
pub trait EventProcessor: Send + Sync {
    fn process(&self, event: UserEvent);

    /// Ask the processor to deliver everything it holds.
    fn flush(&self) {}

    /// Drain, flush, and release resources. Idempotent.
    fn close(&self) {}
}

/// Configuration for [`BatchEventProcessor`].
#[derive(Debug, Clone)]
pub struct BatchEventProcessorConfig {
    /// Flush as soon as this many events are buffered.
    pub batch_size: usize,
    /// Flush when this much time has passed since the first event of the
    /// current batch.
    pub flush_interval: Duration,
    /// Capacity of the producer channel; enqueueing into a full channel
    /// drops the event.
    pub queue_capacity: usize,
    /// How long `close` waits for the consumer thread to drain.
    pub shutdown_timeout: Duration,
}

impl BatchEventProcessorConfig {
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> BatchEventProcessorConfig {
        BatchEventProcessorConfig::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> BatchEventProcessorConfig {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> BatchEventProcessorConfig {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> BatchEventProcessorConfig {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> BatchEventProcessorConfig {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for BatchEventProcessorConfig {
    fn default() -> BatchEventProcessorConfig {
        BatchEventProcessorConfig {
            batch_size: BatchEventProcessorConfig::DEFAULT_BATCH_SIZE,
            flush_interval: BatchEventProcessorConfig::DEFAULT_FLUSH_INTERVAL,
            queue_capacity: BatchEventProcessorConfig::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: BatchEventProcessorConfig::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

enum Signal {
    Event(Box<UserEvent>),
    Flush,
    Shutdown,
}

/// Batched event processor backed by a single consumer thread.
pub struct BatchEventProcessor {
    sender: SyncSender<Signal>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl BatchEventProcessor {
    /// Start the consumer thread.
    pub fn start(
        dispatcher: Arc<dyn EventDispatcher>,
        notifications: Arc<NotificationCenter>,
        config: BatchEventProcessorConfig,
    ) -> std::io::Result<BatchEventProcessor> {
        let (sender, receiver) = std::sync::mpsc::sync_channel::<Signal>(config.queue_capacity);
        let shutdown_timeout = config.shutdown_timeout;

        let handle = std::thread::Builder::new()
            .name("splitstream-events".to_owned())
            .spawn(move || {
                let mut batch: Vec<UserEvent> = Vec::new();
                // Deadline of the current batch; set when its first event
                // arrives.
                let mut deadline: Option<Instant> = None;

                loop {
                    let timeout = match deadline {
                        Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                        None => config.flush_interval,
                    };
                    match receiver.recv_timeout(timeout) {
                        Ok(Signal::Event(event)) => {
                            if should_split(&batch, &event) {
                                log::debug!(target: "splitstream",
                                    "event context changed, flushing current batch");
                                flush_batch(&mut batch, &*dispatcher, &notifications);
                                deadline = None;
                            }
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + config.flush_interval);
                            }
                            batch.push(*event);
                            if batch.len() >= config.batch_size {
                                flush_batch(&mut batch, &*dispatcher, &notifications);
                                deadline = None;
                            }
                        }
                        Ok(Signal::Flush) => {
                            flush_batch(&mut batch, &*dispatcher, &notifications);
                            deadline = None;
                        }
                        Ok(Signal::Shutdown) => {
                            log::debug!(target: "splitstream",
                                "event processor received shutdown signal");
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                                flush_batch(&mut batch, &*dispatcher, &notifications);
                                deadline = None;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                flush_batch(&mut batch, &*dispatcher, &notifications);
            })?;

        Ok(BatchEventProcessor {
            sender,
            handle: Mutex::new(Some(handle)),
            shutdown_timeout,
        })
    }
}

impl EventProcessor for BatchEventProcessor {
    fn process(&self, event: UserEvent) {
        match self.sender.try_send(Signal::Event(Box::new(event))) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!(target: "splitstream", "event queue is full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!(target: "splitstream",
                    "event processor has stopped, dropping event");
            }
        }
    }

    fn flush(&self) {
        // Blocking send: a flush request must not be lost to a full queue.
        let _ = self.sender.send(Signal::Flush);
    }

    fn close(&self) {
        if self.sender.send(Signal::Shutdown).is_err() {
            // The consumer already exited.
            return;
        }
        let handle = self
            .handle
            .lock()
            .expect("thread holding event processor handle should not panic")
            .take();
        let Some(handle) = handle else { return };

        let deadline = Instant::now() + self.shutdown_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            log::error!(target: "splitstream",
                "timed out waiting for the event processor to drain");
        }
    }
}

/// A batch only holds events with an identical datafile-derived header.
fn should_split(batch: &[UserEvent], incoming: &UserEvent) -> bool {
    match batch.last() {
        Some(last) => last.context() != incoming.context(),
        None => false,
    }
}

fn flush_batch(
    batch: &mut Vec<UserEvent>,
    dispatcher: &dyn EventDispatcher,
    notifications: &NotificationCenter,
) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    let Some(log_event) = EventFactory::create_log_event(events) else {
        return;
    };

    notifications.send_log_event(&log_event);
    match dispatcher.dispatch_event(&log_event) {
        Ok(()) => {
            log::debug!(target: "splitstream", "flushed batch of {count} events");
        }
        Err(err) => {
            log::warn!(target: "splitstream", "error dispatching event batch: {err}");
        }
    }
}

/// Processor that hands every event to the dispatcher immediately, without
/// batching. Useful for tests and short-lived processes.
pub struct ForwardingEventProcessor {
    dispatcher: Arc<dyn EventDispatcher>,
    notifications: Arc<NotificationCenter>,
}

impl ForwardingEventProcessor {
    pub fn new(
        dispatcher: Arc<dyn EventDispatcher>,
        notifications: Arc<NotificationCenter>,
    ) -> ForwardingEventProcessor {
        ForwardingEventProcessor {
            dispatcher,
            notifications,
        }
    }
}

impl EventProcessor for ForwardingEventProcessor {
    fn process(&self, event: UserEvent) {
        let mut batch = vec![event];
        flush_batch(&mut batch, &*self.dispatcher, &self.notifications);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::dispatcher::{DispatchError, LogEvent};
    use crate::events::{ConversionEvent, EventContext};

    #[derive(Default)]
    struct CapturingDispatcher {
        batches: Mutex<Vec<LogEvent>>,
    }

    impl EventDispatcher for CapturingDispatcher {
        fn dispatch_event(&self, event: &LogEvent) -> Result<(), DispatchError> {
            self.batches.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn conversion(revision: &str, user_id: &str) -> UserEvent {
        UserEvent::Conversion(ConversionEvent {
            context: EventContext {
                account_id: "acc".to_owned(),
                project_id: "proj".to_owned(),
                revision: revision.to_owned(),
                anonymize_ip: false,
            },
            user_id: user_id.to_owned(),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            attributes: vec![],
            event_id: "ev-1".to_owned(),
            event_key: "purchase".to_owned(),
            tags: serde_json::Map::new(),
        })
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached within 5s");
    }

    fn start(
        config: BatchEventProcessorConfig,
    ) -> (BatchEventProcessor, Arc<CapturingDispatcher>) {
        let dispatcher = Arc::new(CapturingDispatcher::default());
        let processor = BatchEventProcessor::start(
            dispatcher.clone(),
            Arc::new(NotificationCenter::new()),
            config,
        )
        .unwrap();
        (processor, dispatcher)
    }

    #[test]
    fn flushes_when_batch_size_is_reached() {
        let (processor, dispatcher) =
            start(BatchEventProcessorConfig::new().with_batch_size(2));

        processor.process(conversion("1", "u1"));
        processor.process(conversion("1", "u2"));

        wait_for(|| dispatcher.batches.lock().unwrap().len() == 1);
        let batches = dispatcher.batches.lock().unwrap();
        assert_eq!(batches[0].params.visitors.len(), 2);
        drop(batches);
        processor.close();
    }

    #[test]
    fn flushes_after_the_flush_interval() {
        let (processor, dispatcher) = start(
            BatchEventProcessorConfig::new()
                .with_flush_interval(Duration::from_millis(50)),
        );

        processor.process(conversion("1", "u1"));
        wait_for(|| dispatcher.batches.lock().unwrap().len() == 1);
        processor.close();
    }

    #[test]
    fn explicit_flush_delivers_partial_batches() {
        let (processor, dispatcher) = start(BatchEventProcessorConfig::new());

        processor.process(conversion("1", "u1"));
        processor.flush();

        wait_for(|| dispatcher.batches.lock().unwrap().len() == 1);
        processor.close();
    }

    #[test]
    fn close_drains_pending_events() {
        let (processor, dispatcher) = start(BatchEventProcessorConfig::new());

        processor.process(conversion("1", "u1"));
        processor.process(conversion("1", "u2"));
        processor.process(conversion("1", "u3"));
        processor.close();

        let batches = dispatcher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].params.visitors.len(), 3);
    }

    #[test]
    fn revision_change_splits_the_batch() {
        let (processor, dispatcher) = start(BatchEventProcessorConfig::new());

        processor.process(conversion("1", "u1"));
        processor.process(conversion("2", "u2"));
        processor.close();

        let batches = dispatcher.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].params.revision, "1");
        assert_eq!(batches[1].params.revision, "2");
    }

    #[test]
    fn process_after_close_does_not_panic() {
        let (processor, _dispatcher) = start(BatchEventProcessorConfig::new());
        processor.close();
        processor.process(conversion("1", "u1"));
    }

    #[test]
    fn forwarding_processor_dispatches_immediately() {
        let dispatcher = Arc::new(CapturingDispatcher::default());
        let processor = ForwardingEventProcessor::new(
            dispatcher.clone(),
            Arc::new(NotificationCenter::new()),
        );
        processor.process(conversion("1", "u1"));
        assert_eq!(dispatcher.batches.lock().unwrap().len(), 1);
    }
}
