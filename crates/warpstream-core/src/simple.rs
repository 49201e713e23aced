//! Push-style publisher: callers `send` items, the subscriber pulls them.
//!
//! Every operation is queued as an entry and a single-flight processor
//! delivers entries to the subscriber in order, gated by demand for items.
//! Terminal events and cancellation go through a high-priority queue so
//! they overtake queued data. Each operation reports back through a
//! [`Completion`] (or a callback) once the subscriber has seen it, which
//! lets producers bound how much they keep in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use crate::completion::{completion, Completion};
use crate::error::{StreamError, StreamResult};
use crate::reactive::{add_demand, reject, Publisher, Subscriber, Subscription};
use crate::sync::lock;

/// Invoked once the entry reached the subscriber, or failed to.
pub type DeliveryCallback = Box<dyn FnOnce(StreamResult<()>) + Send>;

enum Entry<T> {
    Next {
        value: T,
        delivered: Option<DeliveryCallback>,
    },
    Complete {
        delivered: Option<DeliveryCallback>,
    },
    Error {
        error: StreamError,
        delivered: Option<DeliveryCallback>,
    },
    Cancel,
}

impl<T> Entry<T> {
    fn is_next(&self) -> bool {
        matches!(self, Entry::Next { .. })
    }

    fn reject(self, error: StreamError) {
        let delivered = match self {
            Entry::Next { delivered, .. }
            | Entry::Complete { delivered }
            | Entry::Error { delivered, .. } => delivered,
            Entry::Cancel => None,
        };
        if let Some(delivered) = delivered {
            delivered(Err(error));
        }
    }
}

struct Inner<T> {
    standard: Mutex<VecDeque<Entry<T>>>,
    high: Mutex<VecDeque<Entry<T>>>,
    processing: AtomicBool,
    demand: AtomicU64,
    failure: Mutex<Option<StreamError>>,
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    subscribed: AtomicBool,
    cancel_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// A single-subscriber publisher fed by [`send`](SimplePublisher::send).
///
/// Stores an unbounded number of queued items; producers are expected to
/// limit their in-flight sends using the returned completions.
pub struct SimplePublisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SimplePublisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Default for SimplePublisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> SimplePublisher<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                standard: Mutex::new(VecDeque::new()),
                high: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                demand: AtomicU64::new(0),
                failure: Mutex::new(None),
                subscriber: Mutex::new(None),
                subscribed: AtomicBool::new(false),
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    /// Queue an item. The completion resolves once `on_next` returned.
    pub fn send(&self, value: T) -> Completion<()> {
        let (completer, completion) = completion();
        self.send_with(
            value,
            Box::new(move |result| {
                completer.finish(result);
            }),
        );
        completion
    }

    /// Like [`send`](Self::send) but reports delivery through a callback,
    /// invoked on whichever thread delivered (or rejected) the item.
    pub fn send_with(&self, value: T, delivered: DeliveryCallback) {
        trace!("simple publisher send");
        self.inner.push(
            false,
            Entry::Next {
                value,
                delivered: Some(delivered),
            },
        );
    }

    /// Signal successful end of stream after all queued items.
    pub fn complete(&self) -> Completion<()> {
        let (completer, completion) = completion();
        self.inner.push(
            false,
            Entry::Complete {
                delivered: Some(Box::new(move |result| {
                    completer.finish(result);
                })),
            },
        );
        completion
    }

    /// Signal failure after all queued items.
    pub fn error(&self, error: StreamError) -> Completion<()> {
        let (completer, completion) = completion();
        self.inner.push(
            false,
            Entry::Error {
                error,
                delivered: Some(Box::new(move |result| {
                    completer.finish(result);
                })),
            },
        );
        completion
    }

    /// Run `hook` once if the subscriber cancels.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        *lock(&self.inner.cancel_hook) = Some(Box::new(hook));
    }

    /// Whether a terminal signal was delivered or the subscriber cancelled.
    pub fn is_terminated(&self) -> bool {
        lock(&self.inner.failure).is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(&*lock(&self.inner.failure), Some(StreamError::Cancelled(_)))
    }
}

impl<T: Send + 'static> Inner<T> {
    fn push(self: &Arc<Self>, high_priority: bool, entry: Entry<T>) {
        let queue = if high_priority {
            &self.high
        } else {
            &self.standard
        };
        lock(queue).push_back(entry);
        self.process();
    }

    fn process(self: &Arc<Self>) {
        loop {
            if self
                .processing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.process_entries();
            self.processing.store(false, Ordering::Release);

            // Entries may have arrived after we decided to stop.
            if !self.should_process(&self.high) && !self.should_process(&self.standard) {
                return;
            }
        }
    }

    fn should_process(&self, queue: &Mutex<VecDeque<Entry<T>>>) -> bool {
        let failed = lock(&self.failure).is_some();
        let subscribed = lock(&self.subscriber).is_some();
        let has_demand = self.demand.load(Ordering::Acquire) > 0;
        match lock(queue).front() {
            None => false,
            Some(_) if failed => true,
            Some(_) if !subscribed => false,
            Some(entry) => !entry.is_next() || has_demand,
        }
    }

    fn next_entry(&self) -> Option<Entry<T>> {
        if self.should_process(&self.high) {
            return lock(&self.high).pop_front();
        }
        if self.should_process(&self.standard) {
            return lock(&self.standard).pop_front();
        }
        None
    }

    fn process_entries(&self) {
        while let Some(entry) = self.next_entry() {
            let failure = lock(&self.failure).clone();
            if let Some(failure) = failure {
                entry.reject(failure);
                continue;
            }

            let subscriber = lock(&self.subscriber).clone();
            let Some(subscriber) = subscriber else {
                // Only reachable after cancellation cleared the subscriber.
                entry.reject(StreamError::Cancelled("subscription has been cancelled".into()));
                continue;
            };

            match entry {
                Entry::Next { value, delivered } => {
                    subscriber.on_next(value);
                    self.demand.fetch_sub(1, Ordering::AcqRel);
                    if let Some(delivered) = delivered {
                        delivered(Ok(()));
                    }
                }
                Entry::Complete { delivered } => {
                    self.set_failure(StreamError::ProtocolViolation(
                        "on_complete was already invoked".into(),
                    ));
                    lock(&self.subscriber).take();
                    trace!("simple publisher completing");
                    subscriber.on_complete();
                    if let Some(delivered) = delivered {
                        delivered(Ok(()));
                    }
                }
                Entry::Error { error, delivered } => {
                    self.set_failure(StreamError::ProtocolViolation(format!(
                        "on_error was already invoked: {error}"
                    )));
                    lock(&self.subscriber).take();
                    trace!(error = %error, "simple publisher failing");
                    subscriber.on_error(error);
                    if let Some(delivered) = delivered {
                        delivered(Ok(()));
                    }
                }
                Entry::Cancel => {
                    self.set_failure(StreamError::Cancelled(
                        "subscription has been cancelled".into(),
                    ));
                    lock(&self.subscriber).take();
                    let hook = lock(&self.cancel_hook).take();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
            }
        }
    }

    fn set_failure(&self, error: StreamError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(error);
        }
    }
}

impl<T: Send + 'static> Publisher<T> for SimplePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            reject(
                subscriber.as_ref(),
                StreamError::ProtocolViolation(
                    "only one subscription may be active at a time".into(),
                ),
            );
            return;
        }
        *lock(&self.inner.subscriber) = Some(subscriber.clone());
        subscriber.on_subscribe(Arc::new(SimpleSubscription {
            inner: Arc::downgrade(&self.inner),
        }));
        self.inner.process();
    }
}

struct SimpleSubscription<T> {
    inner: Weak<Inner<T>>,
}

impl<T: Send + 'static> Subscription for SimpleSubscription<T> {
    fn request(&self, n: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if n == 0 {
            inner.push(
                true,
                Entry::Error {
                    error: StreamError::illegal_demand(n),
                    delivered: None,
                },
            );
            return;
        }
        let _ = inner
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(add_demand(current, n))
            });
        inner.process();
    }

    fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            trace!("simple publisher subscription cancelled");
            inner.push(true, Entry::Cancel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::UNBOUNDED;
    use crate::testing::Recorder;
    use std::thread;

    #[test]
    fn items_wait_for_subscriber_and_demand() {
        let publisher = SimplePublisher::<u32>::new();
        let mut first = publisher.send(1);
        let _second = publisher.send(2);

        let recorder = Recorder::<u32>::new(0).shared();
        publisher.subscribe(recorder.clone());
        assert!(recorder.items().is_empty());
        assert!(first.try_result().is_none());

        recorder.request(1);
        assert_eq!(recorder.items(), vec![1]);
        assert!(first.try_result().unwrap().is_ok());

        recorder.request(5);
        let _ = publisher.complete();
        assert_eq!(recorder.items(), vec![1, 2]);
        assert!(recorder.is_complete());
        recorder.assert_well_formed();
    }

    #[test]
    fn completion_does_not_need_demand() {
        let publisher = SimplePublisher::<u32>::new();
        let recorder = Recorder::<u32>::new(0).shared();
        publisher.subscribe(recorder.clone());
        let mut done = publisher.complete();
        assert!(recorder.is_complete());
        assert!(done.try_result().unwrap().is_ok());
    }

    #[test]
    fn send_after_complete_fails() {
        let publisher = SimplePublisher::<u32>::new();
        let recorder = Recorder::<u32>::new(10).shared();
        publisher.subscribe(recorder.clone());
        let _ = publisher.complete();

        let mut late = publisher.send(9);
        assert!(matches!(
            late.try_result(),
            Some(Err(StreamError::ProtocolViolation(_)))
        ));
        assert!(recorder.items().is_empty());
        recorder.assert_well_formed();
    }

    #[test]
    fn cancel_fails_pending_sends_and_runs_hook() {
        let publisher = SimplePublisher::<u32>::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        publisher.on_cancel(move || flag.store(true, Ordering::SeqCst));

        let recorder = Recorder::<u32>::new(0).shared();
        publisher.subscribe(recorder.clone());
        let mut pending = publisher.send(1);
        recorder.cancel();

        assert!(cancelled.load(Ordering::SeqCst));
        assert!(publisher.is_cancelled());
        assert!(matches!(
            pending.try_result(),
            Some(Err(StreamError::Cancelled(_)))
        ));
        assert_eq!(recorder.signal_count(), 1);
    }

    #[test]
    fn cancel_racing_sends_delivers_nothing_afterwards() {
        for _ in 0..20 {
            let publisher = SimplePublisher::<u32>::new();
            let recorder = Recorder::<u32>::new(UNBOUNDED).shared();
            publisher.subscribe(recorder.clone());

            let producer = {
                let publisher = publisher.clone();
                thread::spawn(move || (0..5_000u32).map(|i| publisher.send(i)).collect::<Vec<_>>())
            };
            while recorder.items().is_empty() {
                thread::yield_now();
            }
            let canceller = {
                let recorder = recorder.clone();
                thread::spawn(move || recorder.cancel())
            };
            canceller.join().unwrap();
            let seen = recorder.items().len();
            let mut sends = producer.join().unwrap();

            let items = recorder.items();
            assert!(items.len() <= seen + 1, "{} items after {seen}", items.len());
            assert!(publisher.is_cancelled());
            assert!(!recorder.is_terminated());
            recorder.assert_well_formed();

            // Every send resolved: delivered ones succeeded, the rest were cancelled.
            let mut delivered = 0;
            for send in &mut sends {
                match send.try_result() {
                    Some(Ok(())) => delivered += 1,
                    Some(Err(StreamError::Cancelled(_))) => {}
                    other => panic!("unexpected send outcome: {other:?}"),
                }
            }
            assert_eq!(delivered, items.len());
        }
    }

    #[test]
    fn second_subscriber_is_rejected() {
        let publisher = SimplePublisher::<u32>::new();
        let first = Recorder::<u32>::new(1).shared();
        let second = Recorder::<u32>::new(1).shared();
        publisher.subscribe(first.clone());
        publisher.subscribe(second.clone());
        assert!(matches!(
            second.error(),
            Some(StreamError::ProtocolViolation(_))
        ));
        let _ = publisher.send(4);
        assert_eq!(first.items(), vec![4]);
    }

    #[test]
    fn invalid_request_overtakes_queued_items() {
        let publisher = SimplePublisher::<u32>::new();
        let _ = publisher.send(1);
        let recorder = Recorder::<u32>::new(0).shared();
        publisher.subscribe(recorder.clone());
        recorder.request(0);
        assert!(matches!(
            recorder.error(),
            Some(StreamError::IllegalArgument(_))
        ));
        assert!(recorder.items().is_empty());
        recorder.assert_well_formed();
    }

    #[test]
    fn delivery_callback_may_send_more() {
        let publisher = SimplePublisher::<u32>::new();
        let recorder = Recorder::<u32>::new(10).shared();
        publisher.subscribe(recorder.clone());

        let chained = publisher.clone();
        publisher.send_with(
            1,
            Box::new(move |result| {
                assert!(result.is_ok());
                let _ = chained.send(2);
                let _ = chained.complete();
            }),
        );
        assert_eq!(recorder.items(), vec![1, 2]);
        assert!(recorder.is_complete());
    }
}
