//! A recording subscriber for exercising publishers in tests.
//!
//! [`Recorder`] captures every signal in arrival order, flags overlapping
//! callbacks, and can be configured to request more or cancel from inside
//! `on_next`. It offers both blocking and async waits for the terminal
//! signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::StreamError;
use crate::reactive::{Subscriber, Subscription};
use crate::sync::lock;

#[derive(Debug, Clone)]
pub enum Signal<T> {
    Subscribe,
    Next(T),
    Error(StreamError),
    Complete,
}

impl<T> Signal<T> {
    fn is_terminal(&self) -> bool {
        matches!(self, Signal::Error(_) | Signal::Complete)
    }
}

pub struct Recorder<T> {
    initial_request: u64,
    request_per_item: u64,
    cancel_after: Option<usize>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    signals: Mutex<Vec<Signal<T>>>,
    received: AtomicUsize,
    in_callback: AtomicBool,
    overlapped: AtomicBool,
    finished: (Mutex<bool>, Condvar),
    notify: Notify,
}

impl<T: Clone + Send + 'static> Recorder<T> {
    /// A recorder that requests `initial_request` items on subscribe (0 = none).
    pub fn new(initial_request: u64) -> Self {
        Self {
            initial_request,
            request_per_item: 0,
            cancel_after: None,
            subscription: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
            received: AtomicUsize::new(0),
            in_callback: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            finished: (Mutex::new(false), Condvar::new()),
            notify: Notify::new(),
        }
    }

    /// Request `n` more items from inside every `on_next`.
    pub fn per_item(mut self, n: u64) -> Self {
        self.request_per_item = n;
        self
    }

    /// Cancel from inside `on_next` once `count` items have arrived.
    pub fn cancel_after(mut self, count: usize) -> Self {
        self.cancel_after = Some(count);
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn request(&self, n: u64) {
        let subscription = lock(&self.subscription).clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        let subscription = lock(&self.subscription).clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn signals(&self) -> Vec<Signal<T>> {
        lock(&self.signals).clone()
    }

    pub fn signal_count(&self) -> usize {
        lock(&self.signals).len()
    }

    pub fn items(&self) -> Vec<T> {
        lock(&self.signals)
            .iter()
            .filter_map(|s| match s {
                Signal::Next(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.signals)
            .iter()
            .any(|s| matches!(s, Signal::Complete))
    }

    pub fn error(&self) -> Option<StreamError> {
        lock(&self.signals).iter().find_map(|s| match s {
            Signal::Error(e) => Some(e.clone()),
            _ => None,
        })
    }

    pub fn is_terminated(&self) -> bool {
        *lock(&self.finished.0)
    }

    /// Block until a terminal signal arrives. Returns `false` on timeout.
    pub fn wait_terminal(&self, timeout: Duration) -> bool {
        let (done, condvar) = &self.finished;
        let guard = lock(done);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    /// Wait asynchronously until a terminal signal arrives.
    pub async fn terminated(&self) {
        loop {
            if self.is_terminated() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Panic unless the recorded signals obey the subscriber contract.
    pub fn assert_well_formed(&self) {
        let signals = lock(&self.signals);
        assert!(
            matches!(signals.first(), Some(Signal::Subscribe)),
            "first signal must be on_subscribe"
        );
        let subscribes = signals
            .iter()
            .filter(|s| matches!(s, Signal::Subscribe))
            .count();
        assert_eq!(subscribes, 1, "on_subscribe delivered {subscribes} times");
        if let Some(position) = signals.iter().position(Signal::is_terminal) {
            assert_eq!(
                position,
                signals.len() - 1,
                "signal observed after terminal signal"
            );
        }
        assert!(
            !self.overlapped.load(Ordering::Acquire),
            "overlapping subscriber callbacks"
        );
    }

    fn record(&self, signal: Signal<T>) {
        let terminal = signal.is_terminal();
        lock(&self.signals).push(signal);
        if terminal {
            let (done, condvar) = &self.finished;
            *lock(done) = true;
            condvar.notify_all();
        }
        self.notify.notify_one();
    }

    fn enter(&self) {
        if self.in_callback.swap(true, Ordering::AcqRel) {
            self.overlapped.store(true, Ordering::Release);
        }
    }

    fn exit(&self) {
        self.in_callback.store(false, Ordering::Release);
    }
}

impl Recorder<Bytes> {
    /// Concatenate every received chunk.
    pub fn concat(&self) -> Bytes {
        let mut out = BytesMut::new();
        for chunk in self.items() {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for Recorder<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.record(Signal::Subscribe);
        *lock(&self.subscription) = Some(subscription.clone());
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&self, item: T) {
        self.enter();
        self.record(Signal::Next(item));
        let received = self.received.fetch_add(1, Ordering::AcqRel) + 1;
        if self.cancel_after.is_some_and(|limit| received >= limit) {
            self.cancel();
        } else if self.request_per_item > 0 {
            self.request(self.request_per_item);
        }
        self.exit();
    }

    fn on_error(&self, error: StreamError) {
        self.enter();
        self.record(Signal::Error(error));
        self.exit();
    }

    fn on_complete(&self) {
        self.enter();
        self.record(Signal::Complete);
        self.exit();
    }
}
