//! Demand-tracking subscription shared by every pull-driven publisher.
//!
//! A [`DemandSubscription`] owns a subscriber and a [`Generator`]. Demand
//! granted through [`Subscription::request`] accumulates in an atomic
//! counter (saturating at [`UNBOUNDED`](crate::reactive::UNBOUNDED)) and a single-flight drain loop
//! turns demand into `on_next` calls. Whichever thread wins the `emitting`
//! compare-and-swap runs the loop; every other caller just adds demand and
//! leaves. After releasing the flag the winner re-checks for work that
//! arrived while it was emitting, so no wakeup is lost and recursion from
//! `request` inside `on_next` stays bounded.
//!
//! The drain loop observes cancellation and externally injected failures
//! ([`DemandSubscription::fail`]) on every iteration, not just at entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{StreamError, StreamResult};
use crate::reactive::{add_demand, Publisher, Subscriber, Subscription};
use crate::sync::lock;

/// Produces items on demand for a [`DemandSubscription`].
///
/// `has_next` must be cheap and side-effect free: the drain loop calls it
/// to decide whether to complete the subscriber even when no demand is
/// outstanding.
pub trait Generator<T>: Send {
    fn has_next(&self) -> bool;
    fn next(&mut self) -> StreamResult<T>;
}

pub struct DemandSubscription<T, G> {
    subscriber: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    generator: Mutex<Option<G>>,
    demand: AtomicU64,
    emitting: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    pending_error: Mutex<Option<StreamError>>,
}

impl<T, G> DemandSubscription<T, G>
where
    T: Send + 'static,
    G: Generator<T> + 'static,
{
    /// Install a new subscription on `subscriber` and deliver `on_subscribe`.
    ///
    /// An already-exhausted generator completes the subscriber right away,
    /// without waiting for demand.
    pub fn subscribe(subscriber: Arc<dyn Subscriber<T>>, generator: G) -> Arc<Self> {
        let subscription = Arc::new(Self {
            subscriber: Mutex::new(Some(subscriber.clone())),
            generator: Mutex::new(Some(generator)),
            demand: AtomicU64::new(0),
            emitting: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            pending_error: Mutex::new(None),
        });
        subscriber.on_subscribe(subscription.clone());
        subscription.drain();
        subscription
    }

    /// Terminate the subscriber with `error` as soon as no emission is in flight.
    pub fn fail(&self, error: StreamError) {
        {
            let mut pending = lock(&self.pending_error);
            if pending.is_none() {
                *pending = Some(error);
            }
        }
        self.drain();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Currently outstanding demand.
    pub fn demand(&self) -> u64 {
        self.demand.load(Ordering::Acquire)
    }

    fn drain(&self) {
        loop {
            if self
                .emitting
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.emit_loop();
            self.emitting.store(false, Ordering::Release);

            if !self.has_pending_work() {
                return;
            }
        }
    }

    fn emit_loop(&self) {
        loop {
            if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
                return;
            }
            if let Some(error) = lock(&self.pending_error).take() {
                self.terminate(Err(error));
                return;
            }

            let produced = {
                let mut generator = lock(&self.generator);
                let Some(generator) = generator.as_mut() else {
                    return;
                };
                if !generator.has_next() {
                    None
                } else if self.demand.load(Ordering::Acquire) == 0 {
                    return;
                } else {
                    self.demand.fetch_sub(1, Ordering::AcqRel);
                    Some(generator.next())
                }
            };

            match produced {
                None => {
                    self.terminate(Ok(()));
                    return;
                }
                Some(Ok(item)) => {
                    let subscriber = lock(&self.subscriber).clone();
                    if let Some(subscriber) = subscriber {
                        subscriber.on_next(item);
                    }
                }
                Some(Err(error)) => {
                    self.terminate(Err(error));
                    return;
                }
            }
        }
    }

    fn has_pending_work(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        if lock(&self.pending_error).is_some() {
            return true;
        }
        match lock(&self.generator).as_ref() {
            Some(generator) => !generator.has_next() || self.demand.load(Ordering::Acquire) > 0,
            None => false,
        }
    }

    fn terminate(&self, result: Result<(), StreamError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriber = lock(&self.subscriber).take();
        lock(&self.generator).take();
        let Some(subscriber) = subscriber else {
            return;
        };
        match result {
            Ok(()) => {
                trace!("demand subscription completed");
                subscriber.on_complete();
            }
            Err(error) => {
                trace!(error = %error, "demand subscription failed");
                subscriber.on_error(error);
            }
        }
    }
}

impl<T, G> Subscription for DemandSubscription<T, G>
where
    T: Send + 'static,
    G: Generator<T> + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.fail(StreamError::illegal_demand(n));
            return;
        }
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(add_demand(current, n))
            });
        self.drain();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!("demand subscription cancelled");
        lock(&self.subscriber).take();
        lock(&self.generator).take();
    }
}

/// Walks a fixed list of items, cloning each one out. Used for replay and
/// in-memory sources where items are cheap shared views.
pub struct SliceGenerator<T> {
    items: Arc<[T]>,
    index: usize,
}

impl<T> SliceGenerator<T> {
    pub fn new(items: Arc<[T]>) -> Self {
        Self { items, index: 0 }
    }
}

impl<T: Clone + Send + Sync> Generator<T> for SliceGenerator<T> {
    fn has_next(&self) -> bool {
        self.index < self.items.len()
    }

    fn next(&mut self) -> StreamResult<T> {
        let item = self.items[self.index].clone();
        self.index += 1;
        Ok(item)
    }
}

/// Publishes a fixed list to every subscriber, each at its own pace.
pub struct ListPublisher<T> {
    items: Arc<[T]>,
}

impl<T> ListPublisher<T> {
    pub fn new(items: impl Into<Arc<[T]>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for ListPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        DemandSubscription::subscribe(subscriber, SliceGenerator::new(self.items.clone()));
    }
}
