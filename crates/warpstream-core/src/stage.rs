//! Per-item transform operator with its own demand accounting.
//!
//! A [`StagePublisher`] wraps an upstream publisher and runs every item
//! through a [`Stage`] that may emit zero, one or many outputs per input,
//! plus a tail at end of stream. The operator requests upstream one item at
//! a time, only when its output queue is empty and the downstream has
//! outstanding demand, so a one-to-many stage never emits beyond what was
//! requested. Map, split, flatten and tail-append are all expressed this
//! way.
//!
//! Errors (from upstream or from the stage) are delivered immediately and
//! drop queued outputs; completion waits until the queue has drained.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::trace;

use crate::chunk::ChunkBuffer;
use crate::error::{StreamError, StreamResult};
use crate::reactive::{add_demand, Publisher, Subscriber, Subscription};
use crate::sync::lock;

pub trait Stage<T, U>: Send {
    fn on_item(&mut self, item: T) -> StreamResult<Vec<U>>;

    /// Outputs appended after the last upstream item.
    fn on_end(&mut self) -> StreamResult<Vec<U>> {
        Ok(Vec::new())
    }
}

type StageFactory<T, U> = Box<dyn Fn() -> Box<dyn Stage<T, U>> + Send + Sync>;

/// Publisher applying a fresh [`Stage`] per subscription.
pub struct StagePublisher<T, U> {
    upstream: Arc<dyn Publisher<T>>,
    factory: StageFactory<T, U>,
}

impl<T, U> StagePublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn new<F, S>(upstream: Arc<dyn Publisher<T>>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stage<T, U> + 'static,
    {
        Self {
            upstream,
            factory: Box::new(move || Box::new(factory())),
        }
    }
}

impl<T, U> Publisher<U> for StagePublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<U>>) {
        let operator = StageSubscription::new(subscriber, (self.factory)());
        self.upstream.subscribe(operator);
    }
}

/// Apply `f` to every item.
pub fn map<T, U, F>(upstream: Arc<dyn Publisher<T>>, f: F) -> StagePublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> StreamResult<U> + Clone + Send + Sync + 'static,
{
    StagePublisher::new(upstream, move || MapStage::new(f.clone()))
}

/// Emit every element of every upstream group, in order.
pub fn flatten<T>(upstream: Arc<dyn Publisher<Vec<T>>>) -> StagePublisher<Vec<T>, T>
where
    T: Send + 'static,
{
    StagePublisher::new(upstream, || FlattenStage)
}

/// Re-cut an upstream byte stream into chunks of `chunk_size`.
pub fn rechunk(
    upstream: Arc<dyn Publisher<Bytes>>,
    chunk_size: usize,
    total_length: Option<u64>,
) -> StagePublisher<Bytes, Bytes> {
    StagePublisher::new(upstream, move || ChunkStage::new(chunk_size, total_length))
}

pub struct MapStage<F> {
    f: F,
}

impl<F> MapStage<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<T, U, F> Stage<T, U> for MapStage<F>
where
    F: FnMut(T) -> StreamResult<U> + Send,
{
    fn on_item(&mut self, item: T) -> StreamResult<Vec<U>> {
        Ok(vec![(self.f)(item)?])
    }
}

pub struct FlattenStage;

impl<T: Send> Stage<Vec<T>, T> for FlattenStage {
    fn on_item(&mut self, item: Vec<T>) -> StreamResult<Vec<T>> {
        Ok(item)
    }
}

/// Splits through a [`ChunkBuffer`] and flushes its tail at end of stream.
///
/// Bytes beyond a known total fail the stream with
/// [`StreamError::DataIntegrity`].
pub struct ChunkStage {
    buffer: ChunkBuffer,
}

impl ChunkStage {
    pub fn new(chunk_size: usize, total_length: Option<u64>) -> Self {
        Self {
            buffer: ChunkBuffer::new(chunk_size, total_length),
        }
    }
}

impl Stage<Bytes, Bytes> for ChunkStage {
    fn on_item(&mut self, item: Bytes) -> StreamResult<Vec<Bytes>> {
        let chunks = self.buffer.split(item);
        if self.buffer.surplus() > 0 {
            return Err(StreamError::DataIntegrity(format!(
                "stream produced {} bytes beyond its declared length",
                self.buffer.surplus()
            )));
        }
        Ok(chunks)
    }

    fn on_end(&mut self) -> StreamResult<Vec<Bytes>> {
        Ok(self.buffer.flush().into_iter().collect())
    }
}

/// Subscriber towards the upstream, subscription towards the downstream.
struct StageSubscription<T, U> {
    this: Weak<Self>,
    downstream: Mutex<Option<Arc<dyn Subscriber<U>>>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    stage: Mutex<Option<Box<dyn Stage<T, U>>>>,
    queue: Mutex<VecDeque<U>>,
    demand: AtomicU64,
    upstream_outstanding: AtomicBool,
    upstream_done: AtomicBool,
    failure: Mutex<Option<StreamError>>,
    emitting: AtomicBool,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    _item: PhantomData<fn(T)>,
}

impl<T, U> StageSubscription<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn new(downstream: Arc<dyn Subscriber<U>>, stage: Box<dyn Stage<T, U>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            downstream: Mutex::new(Some(downstream)),
            upstream: Mutex::new(None),
            stage: Mutex::new(Some(stage)),
            queue: Mutex::new(VecDeque::new()),
            demand: AtomicU64::new(0),
            upstream_outstanding: AtomicBool::new(false),
            upstream_done: AtomicBool::new(false),
            failure: Mutex::new(None),
            emitting: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            _item: PhantomData,
        })
    }

    fn set_failure(&self, error: StreamError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(error);
        }
    }

    fn cancel_upstream(&self) {
        let upstream = lock(&self.upstream).clone();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    /// Run the stage outside of any other lock.
    fn run_stage<R>(
        &self,
        f: impl FnOnce(&mut dyn Stage<T, U>) -> StreamResult<R>,
    ) -> Option<StreamResult<R>> {
        let mut stage = lock(&self.stage);
        stage.as_mut().map(|stage| f(stage.as_mut()))
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
            if let Some(error) = lock(&self.failure).take() {
                self.terminate(Err(error));
                return;
            }

            if self.demand.load(Ordering::Acquire) > 0 {
                let next = lock(&self.queue).pop_front();
                if let Some(item) = next {
                    self.demand.fetch_sub(1, Ordering::AcqRel);
                    let downstream = lock(&self.downstream).clone();
                    if let Some(downstream) = downstream {
                        downstream.on_next(item);
                    }
                    continue;
                }
            }

            let queue_empty = lock(&self.queue).is_empty();
            if queue_empty && self.upstream_done.load(Ordering::Acquire) {
                self.terminate(Ok(()));
                return;
            }
            if queue_empty && self.should_request_upstream() {
                let upstream = lock(&self.upstream).clone();
                if let Some(upstream) = upstream {
                    upstream.request(1);
                    continue;
                }
            }
            return;
        }
    }

    fn should_request_upstream(&self) -> bool {
        self.demand.load(Ordering::Acquire) > 0
            && !self.upstream_done.load(Ordering::Acquire)
            && lock(&self.upstream).is_some()
            && !self.upstream_outstanding.swap(true, Ordering::AcqRel)
    }

    fn has_pending_work(&self) -> bool {
        if self.terminated.load(Ordering::Acquire) || self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        if lock(&self.failure).is_some() {
            return true;
        }
        let queue_empty = lock(&self.queue).is_empty();
        let has_demand = self.demand.load(Ordering::Acquire) > 0;
        let upstream_done = self.upstream_done.load(Ordering::Acquire);
        (has_demand && !queue_empty)
            || (queue_empty && upstream_done)
            || (queue_empty
                && has_demand
                && !upstream_done
                && !self.upstream_outstanding.load(Ordering::Acquire)
                && lock(&self.upstream).is_some())
    }

    fn terminate(&self, result: Result<(), StreamError>) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.queue).clear();
        lock(&self.stage).take();
        let downstream = lock(&self.downstream).take();
        let Some(downstream) = downstream else {
            return;
        };
        match result {
            Ok(()) => downstream.on_complete(),
            Err(error) => {
                trace!(error = %error, "stage failed");
                downstream.on_error(error);
            }
        }
    }
}

impl<T, U> Subscriber<T> for StageSubscription<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut upstream = lock(&self.upstream);
            if upstream.is_some() {
                drop(upstream);
                subscription.cancel();
                return;
            }
            *upstream = Some(subscription);
        }
        let downstream = lock(&self.downstream).clone();
        if let (Some(downstream), Some(this)) = (downstream, self.this.upgrade()) {
            downstream.on_subscribe(this);
        }
        self.drain();
    }

    fn on_next(&self, item: T) {
        self.upstream_outstanding.store(false, Ordering::Release);
        match self.run_stage(|stage| stage.on_item(item)) {
            Some(Ok(outputs)) => lock(&self.queue).extend(outputs),
            Some(Err(error)) => {
                self.cancel_upstream();
                self.set_failure(error);
            }
            None => return,
        }
        self.drain();
    }

    fn on_error(&self, error: StreamError) {
        self.upstream_done.store(true, Ordering::Release);
        self.set_failure(error);
        self.drain();
    }

    fn on_complete(&self) {
        match self.run_stage(|stage| stage.on_end()) {
            Some(Ok(outputs)) => lock(&self.queue).extend(outputs),
            Some(Err(error)) => self.set_failure(error),
            None => return,
        }
        self.upstream_done.store(true, Ordering::Release);
        self.drain();
    }
}

impl<T, U> Subscription for StageSubscription<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            self.cancel_upstream();
            self.set_failure(StreamError::illegal_demand(n));
            self.drain();
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
        self.cancel_upstream();
        lock(&self.queue).clear();
        lock(&self.stage).take();
        lock(&self.downstream).take();
    }
}
