//! Bodies over synchronous readers.
//!
//! Reads run on a dedicated worker thread that sleeps until the subscriber
//! grants demand. Resubscribing (a retry) stops the previous worker, waits
//! for it within a bounded timeout, and seeks the reader back to where the
//! first subscription started.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};
use warpstream_core::config::{DEFAULT_BLOCKING_CHUNK_SIZE, DEFAULT_BLOCKING_RESET_TIMEOUT_MS};
use warpstream_core::reactive::add_demand;
use warpstream_core::sync::lock;
use warpstream_core::{
    reject, BodyConfig, Publisher, RequestBody, StreamError, Subscriber, Subscription,
    DEFAULT_CONTENT_TYPE,
};

/// A body pulling chunks from a blocking `Read + Seek` source.
pub struct BlockingStreamBody<R> {
    reader: Arc<Mutex<R>>,
    content_length: Option<u64>,
    chunk_size: usize,
    reset_timeout: Duration,
    /// Stream position at first subscribe; `None` until then or if unknown.
    start: Mutex<Option<Option<u64>>>,
    current: Mutex<Option<Arc<Worker>>>,
}

impl<R> BlockingStreamBody<R>
where
    R: Read + Seek + Send + 'static,
{
    pub fn new(reader: R, content_length: Option<u64>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            content_length,
            chunk_size: DEFAULT_BLOCKING_CHUNK_SIZE,
            reset_timeout: Duration::from_millis(DEFAULT_BLOCKING_RESET_TIMEOUT_MS),
            start: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: &BodyConfig) -> Self {
        self.chunk_size = config.blocking_chunk_size;
        self.reset_timeout = Duration::from_millis(config.blocking_reset_timeout_ms);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Stop any previous worker and rewind the reader.
    fn reset(&self) -> Result<(), StreamError> {
        let previous = lock(&self.current).take();
        if let Some(previous) = previous {
            previous.stop();
            if !previous.wait_stopped(self.reset_timeout) {
                warn!(timeout = ?self.reset_timeout, "previous blocking reader did not stop");
                return Err(StreamError::NonRetryable(
                    "previous subscription to the blocking body did not stop in time".into(),
                ));
            }
        }

        let mut start = lock(&self.start);
        match *start {
            None => {
                // First subscription: remember where the stream began.
                *start = Some(lock(&self.reader).stream_position().ok());
                Ok(())
            }
            Some(None) => Err(StreamError::NonRetryable(
                "blocking body source position is unknown and cannot be reset".into(),
            )),
            Some(Some(position)) => lock(&self.reader)
                .seek(SeekFrom::Start(position))
                .map(|_| ())
                .map_err(|e| {
                    StreamError::NonRetryable(format!("blocking body source cannot be reset: {e}"))
                }),
        }
    }
}

impl<R> Publisher<Bytes> for BlockingStreamBody<R>
where
    R: Read + Seek + Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        if let Err(error) = self.reset() {
            reject(subscriber.as_ref(), error);
            return;
        }

        let worker = Arc::new(Worker::new(subscriber.clone()));
        *lock(&self.current) = Some(worker.clone());
        subscriber.on_subscribe(worker.clone());

        let reader = self.reader.clone();
        let chunk_size = self.chunk_size;
        let thread_worker = worker.clone();
        let spawned = std::thread::Builder::new()
            .name("warpstream-blocking-body".into())
            .spawn(move || thread_worker.run(reader, chunk_size));
        if let Err(e) = spawned {
            worker.mark_stopped();
            worker.finish(Err(StreamError::io("<blocking body worker>", e)));
        }
    }
}

impl<R> RequestBody for BlockingStreamBody<R>
where
    R: Read + Seek + Send + 'static,
{
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }
}

/// One subscription's worker state, shared with its thread.
struct Worker {
    subscriber: Mutex<Option<Arc<dyn Subscriber<Bytes>>>>,
    demand: Mutex<u64>,
    wakeup: Condvar,
    cancelled: AtomicBool,
    failure: Mutex<Option<StreamError>>,
    stopped: (Mutex<bool>, Condvar),
}

impl Worker {
    fn new(subscriber: Arc<dyn Subscriber<Bytes>>) -> Self {
        Self {
            subscriber: Mutex::new(Some(subscriber)),
            demand: Mutex::new(0),
            wakeup: Condvar::new(),
            cancelled: AtomicBool::new(false),
            failure: Mutex::new(None),
            stopped: (Mutex::new(false), Condvar::new()),
        }
    }

    fn run<R: Read>(&self, reader: Arc<Mutex<R>>, chunk_size: usize) {
        trace!("blocking body worker started");
        let result = self.read_loop(&reader, chunk_size);
        self.mark_stopped();
        if let Some(result) = result {
            self.finish(result);
        }
        trace!("blocking body worker stopped");
    }

    /// `None` when stopped by cancellation.
    fn read_loop<R: Read>(
        &self,
        reader: &Mutex<R>,
        chunk_size: usize,
    ) -> Option<Result<(), StreamError>> {
        loop {
            if !self.await_demand() {
                return None;
            }
            if let Some(error) = lock(&self.failure).take() {
                return Some(Err(error));
            }

            let mut buf = BytesMut::zeroed(chunk_size);
            let read = match lock(reader).read(&mut buf) {
                Ok(read) => read,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(StreamError::io("<blocking body>", e))),
            };
            if read == 0 {
                return Some(Ok(()));
            }
            if self.cancelled.load(Ordering::Acquire) {
                return None;
            }
            buf.truncate(read);
            *lock(&self.demand) -= 1;
            let subscriber = lock(&self.subscriber).clone();
            if let Some(subscriber) = subscriber {
                subscriber.on_next(buf.freeze());
            }
        }
    }

    /// Block until demand is available. Returns `false` once cancelled.
    fn await_demand(&self) -> bool {
        let mut demand = lock(&self.demand);
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return false;
            }
            if *demand > 0 || lock(&self.failure).is_some() {
                return true;
            }
            demand = self
                .wakeup
                .wait(demand)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn finish(&self, result: Result<(), StreamError>) {
        let Some(subscriber) = lock(&self.subscriber).take() else {
            return;
        };
        match result {
            Ok(()) => subscriber.on_complete(),
            Err(error) => {
                debug!(error = %error, "blocking body failed");
                subscriber.on_error(error);
            }
        }
    }

    fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _guard = lock(&self.demand);
        self.wakeup.notify_all();
    }

    fn mark_stopped(&self) {
        let (stopped, condvar) = &self.stopped;
        *lock(stopped) = true;
        condvar.notify_all();
    }

    fn wait_stopped(&self, timeout: Duration) -> bool {
        let (stopped, condvar) = &self.stopped;
        let guard = lock(stopped);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

impl Subscription for Worker {
    fn request(&self, n: u64) {
        let mut demand = lock(&self.demand);
        if n == 0 {
            let mut failure = lock(&self.failure);
            if failure.is_none() {
                *failure = Some(StreamError::illegal_demand(n));
            }
        } else {
            *demand = add_demand(*demand, n);
        }
        self.wakeup.notify_all();
    }

    fn cancel(&self) {
        trace!("blocking body subscription cancelled");
        self.stop();
        lock(&self.subscriber).take();
    }
}
