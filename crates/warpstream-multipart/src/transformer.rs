//! Reassembling a multipart download into one response transformer.
//!
//! [`SplittingTransformer`] hands out one [`PartTransformer`] per request
//! from its subscriber. Each part's body is forwarded into a single shared
//! channel that the wrapped transformer consumes as if it were one
//! response. Parts are forwarded in part-number order: the part at the head
//! streams straight through (paced by the channel), later parts are held in
//! memory until every earlier part has finished.
//!
//! The subscriber cancels its subscription once it has issued every part.
//! Remaining parts then drain into the channel and it completes; a part
//! that was announced but never received fails the download instead of
//! silently truncating it.
//!
//! If the wrapped transformer cancels the channel, every part still
//! streaming is cancelled and its `prepare()` future fails.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, trace, warn};
use warpstream_core::sync::lock;
use warpstream_core::{
    completion, reject, Completer, Completion, DemandSubscription, Generator, Publisher,
    ResponseTransformer, SimplePublisher, StreamError, StreamResult, Subscriber, Subscription,
};

/// Called once a part's chunk was forwarded (or buffered), or could not be.
type Resume = Box<dyn FnOnce(StreamResult<()>) + Send>;

enum Outgoing {
    Chunk(Bytes, Option<Resume>),
    Complete,
    Fail(StreamError),
}

#[derive(Default)]
struct Pending {
    chunks: VecDeque<Bytes>,
    complete: bool,
}

struct Sequence {
    /// Part currently forwarded into the channel.
    head: u32,
    announced: u32,
    started: BTreeSet<u32>,
    pending: BTreeMap<u32, Pending>,
    streamed: bool,
    closing: bool,
    finished: bool,
}

struct Shared<R, O> {
    upstream: Arc<dyn ResponseTransformer<R, O>>,
    channel: SimplePublisher<Bytes>,
    sequence: Mutex<Sequence>,
    outbox: Mutex<VecDeque<Outgoing>>,
    draining: AtomicBool,
    /// Parts whose bodies are still streaming.
    live: Mutex<BTreeMap<u32, Weak<PartSubscriber<R, O>>>>,
}

impl<R, O> Shared<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn announce(&self) -> u32 {
        let mut sequence = lock(&self.sequence);
        sequence.announced += 1;
        sequence.announced
    }

    /// Register `part` as streaming. The first part to get here opens the
    /// shared channel toward the wrapped transformer.
    fn start(&self, part: u32, response: R) -> StreamResult<()> {
        let first = {
            let mut sequence = lock(&self.sequence);
            if sequence.finished {
                return Err(StreamError::Cancelled(format!(
                    "download already finished; part {part} arrived too late"
                )));
            }
            sequence.started.insert(part);
            !std::mem::replace(&mut sequence.streamed, true)
        };
        if first {
            debug!(part, "first part streaming; opening response channel");
            self.upstream.on_response(response);
            self.upstream.on_stream(Arc::new(self.channel.clone()));
        }
        Ok(())
    }

    fn accept(&self, part: u32, chunk: Bytes, resume: Resume) {
        let resume_now = {
            let mut sequence = lock(&self.sequence);
            if sequence.finished {
                Some((
                    resume,
                    Err(StreamError::Cancelled(format!(
                        "download already finished; dropping data for part {part}"
                    ))),
                ))
            } else if part == sequence.head {
                lock(&self.outbox).push_back(Outgoing::Chunk(chunk, Some(resume)));
                None
            } else {
                sequence
                    .pending
                    .entry(part)
                    .or_default()
                    .chunks
                    .push_back(chunk);
                Some((resume, Ok(())))
            }
        };
        self.drain();
        if let Some((resume, result)) = resume_now {
            resume(result);
        }
    }

    fn complete_part(&self, part: u32) {
        {
            let mut sequence = lock(&self.sequence);
            if sequence.finished {
                return;
            }
            if part == sequence.head {
                sequence.head += 1;
                self.advance(&mut sequence);
            } else {
                sequence.pending.entry(part).or_default().complete = true;
            }
            trace!(part, head = sequence.head, "part complete");
            if sequence.closing && sequence.head > sequence.announced {
                sequence.finished = true;
                lock(&self.outbox).push_back(Outgoing::Complete);
            }
        }
        self.drain();
    }

    /// Move buffered parts that are now at the head into the outbox.
    fn advance(&self, sequence: &mut Sequence) {
        while let Some(pending) = sequence.pending.remove(&sequence.head) {
            let mut outbox = lock(&self.outbox);
            outbox.extend(pending.chunks.into_iter().map(|c| Outgoing::Chunk(c, None)));
            if !pending.complete {
                break;
            }
            sequence.head += 1;
        }
    }

    fn fail(&self, error: StreamError) {
        let streamed = {
            let mut sequence = lock(&self.sequence);
            if sequence.finished {
                return;
            }
            sequence.finished = true;
            sequence.pending.clear();
            sequence.streamed
        };
        warn!(error = %error, "multipart download failed");
        let live = std::mem::take(&mut *lock(&self.live));
        for part in live.values().filter_map(Weak::upgrade) {
            part.abort(error.clone());
        }
        if streamed {
            lock(&self.outbox).push_back(Outgoing::Fail(error));
            self.drain();
        } else {
            self.upstream.exception_occurred(error);
        }
    }

    fn on_channel_cancel(&self) {
        debug!("response channel cancelled by the wrapped transformer");
        self.fail(StreamError::Cancelled(
            "the combined response stream was cancelled".into(),
        ));
    }

    fn on_downstream_cancel(&self) {
        let error = {
            let mut sequence = lock(&self.sequence);
            if sequence.finished || sequence.closing {
                return;
            }
            sequence.closing = true;
            let missing = (sequence.head..=sequence.announced).find(|p| !sequence.started.contains(p));
            if !sequence.streamed {
                Some(StreamError::Client("no part of the download was received".into()))
            } else if let Some(missing) = missing {
                Some(StreamError::Client(format!(
                    "part {missing} of {} was never received",
                    sequence.announced
                )))
            } else {
                if sequence.head > sequence.announced {
                    sequence.finished = true;
                    lock(&self.outbox).push_back(Outgoing::Complete);
                }
                None
            }
        };
        debug!(failed = error.is_some(), "part requests finished");
        match error {
            Some(error) => self.fail(error),
            None => self.drain(),
        }
    }

    /// Push queued outgoing signals into the channel in order, one thread
    /// at a time.
    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let Some(outgoing) = lock(&self.outbox).pop_front() else {
                    break;
                };
                match outgoing {
                    Outgoing::Chunk(chunk, resume) => self.channel.send_with(
                        chunk,
                        Box::new(move |delivered| {
                            if let Some(resume) = resume {
                                resume(delivered);
                            }
                        }),
                    ),
                    Outgoing::Complete => {
                        let _ = self.channel.complete();
                    }
                    Outgoing::Fail(error) => {
                        let _ = self.channel.error(error);
                    }
                }
            }
            self.draining.store(false, Ordering::Release);
            if lock(&self.outbox).is_empty() {
                return;
            }
        }
    }
}

/// Fans a single response transformer out over many part responses.
pub struct SplittingTransformer<R, O> {
    shared: Arc<Shared<R, O>>,
    subscribed: AtomicBool,
}

impl<R, O> SplittingTransformer<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    /// Returns the transformer and the overall result, which is `upstream`'s
    /// own result.
    pub fn new(upstream: Arc<dyn ResponseTransformer<R, O>>) -> (Self, Completion<O>) {
        let result = upstream.prepare();
        let shared = Arc::new(Shared {
            upstream,
            channel: SimplePublisher::new(),
            sequence: Mutex::new(Sequence {
                head: 1,
                announced: 0,
                started: BTreeSet::new(),
                pending: BTreeMap::new(),
                streamed: false,
                closing: false,
                finished: false,
            }),
            outbox: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            live: Mutex::new(BTreeMap::new()),
        });
        let weak = Arc::downgrade(&shared);
        shared.channel.on_cancel(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_channel_cancel();
            }
        });
        let transformer = Self {
            shared,
            subscribed: AtomicBool::new(false),
        };
        (transformer, result)
    }
}

impl<R, O> Publisher<Arc<PartTransformer<R, O>>> for SplittingTransformer<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Arc<PartTransformer<R, O>>>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            reject(
                subscriber.as_ref(),
                StreamError::ProtocolViolation(
                    "a splitting transformer can only be subscribed once".into(),
                ),
            );
            return;
        }
        DemandSubscription::subscribe(
            Arc::new(CancelObserver {
                downstream: subscriber,
                shared: self.shared.clone(),
            }),
            PartGenerator {
                shared: self.shared.clone(),
            },
        );
    }
}

struct PartGenerator<R, O> {
    shared: Arc<Shared<R, O>>,
}

impl<R, O> Generator<Arc<PartTransformer<R, O>>> for PartGenerator<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn has_next(&self) -> bool {
        true
    }

    fn next(&mut self) -> StreamResult<Arc<PartTransformer<R, O>>> {
        let part_number = self.shared.announce();
        trace!(part = part_number, "issuing part transformer");
        Ok(Arc::new(PartTransformer {
            part_number,
            shared: self.shared.clone(),
            attempt: Mutex::new(None),
        }))
    }
}

/// Wraps the downstream's subscription so cancelling it closes the
/// download.
struct CancelObserver<R, O> {
    downstream: Arc<dyn Subscriber<Arc<PartTransformer<R, O>>>>,
    shared: Arc<Shared<R, O>>,
}

impl<R, O> Subscriber<Arc<PartTransformer<R, O>>> for CancelObserver<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(Arc::new(ObservedSubscription {
            inner: subscription,
            shared: self.shared.clone(),
        }));
    }

    fn on_next(&self, part: Arc<PartTransformer<R, O>>) {
        self.downstream.on_next(part);
    }

    fn on_error(&self, error: StreamError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct ObservedSubscription<R, O> {
    inner: Arc<dyn Subscription>,
    shared: Arc<Shared<R, O>>,
}

impl<R, O> Subscription for ObservedSubscription<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn request(&self, n: u64) {
        self.inner.request(n);
    }

    fn cancel(&self) {
        self.inner.cancel();
        self.shared.on_downstream_cancel();
    }
}

struct Attempt<R> {
    completer: Arc<Completer<R>>,
    response: Option<R>,
}

/// Handles the response for one part. Resolves to that part's response
/// once its body has been handed on.
pub struct PartTransformer<R, O> {
    part_number: u32,
    shared: Arc<Shared<R, O>>,
    attempt: Mutex<Option<Attempt<R>>>,
}

impl<R, O> PartTransformer<R, O> {
    pub fn part_number(&self) -> u32 {
        self.part_number
    }
}

impl<R, O> ResponseTransformer<R, R> for PartTransformer<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn prepare(&self) -> Completion<R> {
        let (completer, completion) = completion();
        *lock(&self.attempt) = Some(Attempt {
            completer: Arc::new(completer),
            response: None,
        });
        completion
    }

    fn on_response(&self, response: R) {
        if let Some(attempt) = lock(&self.attempt).as_mut() {
            attempt.response = Some(response);
        }
    }

    fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>) {
        let taken = lock(&self.attempt)
            .as_ref()
            .map(|attempt| (attempt.completer.clone(), attempt.response.clone()));
        let Some((completer, response)) = taken else {
            return;
        };
        let Some(response) = response else {
            let error = StreamError::ProtocolViolation(format!(
                "part {} body arrived before its response",
                self.part_number
            ));
            completer.fail(error.clone());
            self.shared.fail(error);
            return;
        };
        if let Err(error) = self.shared.start(self.part_number, response.clone()) {
            completer.fail(error);
            return;
        }
        let subscriber = Arc::new_cyclic(|this| PartSubscriber {
            this: this.clone(),
            part_number: self.part_number,
            shared: self.shared.clone(),
            subscription: Mutex::new(None),
            done: Mutex::new(Some(Box::new(move |result: StreamResult<()>| {
                completer.finish(result.map(|()| response));
            }))),
        });
        lock(&self.shared.live).insert(self.part_number, Arc::downgrade(&subscriber));
        stream.subscribe(subscriber);
    }

    fn exception_occurred(&self, error: StreamError) {
        let completer = lock(&self.attempt).as_ref().map(|a| a.completer.clone());
        if let Some(completer) = completer {
            completer.fail(error.clone());
        }
        self.shared.fail(error);
    }
}

type Done = Box<dyn FnOnce(StreamResult<()>) + Send>;

struct PartSubscriber<R, O> {
    this: Weak<Self>,
    part_number: u32,
    shared: Arc<Shared<R, O>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    done: Mutex<Option<Done>>,
}

impl<R, O> PartSubscriber<R, O> {
    fn finish(&self, result: StreamResult<()>) {
        lock(&self.subscription).take();
        lock(&self.shared.live).remove(&self.part_number);
        let done = lock(&self.done).take();
        if let Some(done) = done {
            done(result);
        }
    }

    /// Stop reading this part's body and fail its future.
    fn abort(&self, error: StreamError) {
        let subscription = lock(&self.subscription).take();
        if let Some(subscription) = subscription {
            trace!(part = self.part_number, "cancelling part body");
            subscription.cancel();
        }
        self.finish(Err(error));
    }
}

impl<R, O> Subscriber<Bytes> for PartSubscriber<R, O>
where
    R: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *lock(&self.subscription) = Some(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, chunk: Bytes) {
        let this = self.this.clone();
        self.shared.accept(
            self.part_number,
            chunk,
            Box::new(move |forwarded| {
                let Some(this) = this.upgrade() else {
                    return;
                };
                match forwarded {
                    Ok(()) => {
                        let subscription = lock(&this.subscription).clone();
                        if let Some(subscription) = subscription {
                            subscription.request(1);
                        }
                    }
                    Err(error) => this.abort(error),
                }
            }),
        );
    }

    fn on_error(&self, error: StreamError) {
        self.finish(Err(error.clone()));
        self.shared.fail(error);
    }

    fn on_complete(&self) {
        self.shared.complete_part(self.part_number);
        self.finish(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use warpstream_body::{BytesBody, BytesTransformer, ResponseBytes};
    use warpstream_core::testing::Recorder;
    use warpstream_core::UNBOUNDED;

    type Parts = Arc<PartTransformer<u16, ResponseBytes<u16>>>;

    /// Counts `on_stream` calls on the wrapped transformer.
    struct Counting {
        inner: BytesTransformer<u16>,
        streams: AtomicUsize,
    }

    impl ResponseTransformer<u16, ResponseBytes<u16>> for Counting {
        fn prepare(&self) -> Completion<ResponseBytes<u16>> {
            self.inner.prepare()
        }
        fn on_response(&self, response: u16) {
            self.inner.on_response(response);
        }
        fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>) {
            self.streams.fetch_add(1, Ordering::AcqRel);
            self.inner.on_stream(stream);
        }
        fn exception_occurred(&self, error: StreamError) {
            self.inner.exception_occurred(error);
        }
    }

    fn setup(parts: u64) -> (Arc<Counting>, Completion<ResponseBytes<u16>>, Arc<Recorder<Parts>>) {
        let upstream = Arc::new(Counting {
            inner: BytesTransformer::new(),
            streams: AtomicUsize::new(0),
        });
        let wrapped: Arc<dyn ResponseTransformer<u16, ResponseBytes<u16>>> = upstream.clone();
        let (splitter, result) = SplittingTransformer::new(wrapped);
        let recorder = Recorder::<Parts>::new(parts).shared();
        splitter.subscribe(recorder.clone());
        (upstream, result, recorder)
    }

    fn deliver(part: &Parts, status: u16, body: &'static str) -> Completion<u16> {
        let done = part.prepare();
        part.on_response(status);
        part.on_stream(Arc::new(BytesBody::from_string(body)));
        done
    }

    #[tokio::test]
    async fn out_of_order_parts_reassemble_in_order() {
        let (upstream, result, recorder) = setup(3);
        let parts = recorder.items();
        assert_eq!(parts.iter().map(|p| p.part_number()).collect::<Vec<_>>(), vec![1, 2, 3]);

        let third = deliver(&parts[2], 206, "ccc");
        let first = deliver(&parts[0], 200, "aaa");
        let second = deliver(&parts[1], 206, "bbb");
        assert_eq!(third.await.unwrap(), 206);
        assert_eq!(first.await.unwrap(), 200);
        assert_eq!(second.await.unwrap(), 206);
        recorder.cancel();

        let output = result.await.unwrap();
        assert_eq!(output.bytes, Bytes::from("aaabbbccc"));
        // The first part to stream supplies the response.
        assert_eq!(output.response, 206);
        assert_eq!(upstream.streams.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn missing_part_is_a_client_error() {
        let (_, result, recorder) = setup(3);
        let parts = recorder.items();
        deliver(&parts[0], 206, "aaa").await.unwrap();
        deliver(&parts[2], 206, "ccc").await.unwrap();
        recorder.cancel();

        assert!(matches!(result.await, Err(StreamError::Client(_))));
    }

    #[tokio::test]
    async fn part_failure_fails_the_download() {
        let (_, result, recorder) = setup(2);
        let parts = recorder.items();
        deliver(&parts[0], 206, "aaa").await.unwrap();

        let second = parts[1].prepare();
        parts[1].exception_occurred(StreamError::Client("connection reset".into()));
        assert!(second.await.is_err());
        assert!(matches!(result.await, Err(StreamError::Client(_))));
    }

    #[tokio::test]
    async fn cancel_before_any_stream_fails_result() {
        let (_, result, recorder) = setup(1);
        recorder.cancel();
        assert!(matches!(result.await, Err(StreamError::Client(_))));
    }

    /// Streams the combined body into `sink` and records nothing else.
    struct Forwarding {
        sink: Arc<Recorder<Bytes>>,
    }

    impl ResponseTransformer<u16, ()> for Forwarding {
        fn prepare(&self) -> Completion<()> {
            let (_, result) = completion();
            result
        }
        fn on_response(&self, _response: u16) {}
        fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>) {
            stream.subscribe(self.sink.clone());
        }
        fn exception_occurred(&self, _error: StreamError) {}
    }

    #[tokio::test]
    async fn cancelled_response_stream_cancels_streaming_part() {
        let sink = Recorder::<Bytes>::new(UNBOUNDED).cancel_after(1).shared();
        let upstream: Arc<dyn ResponseTransformer<u16, ()>> =
            Arc::new(Forwarding { sink: sink.clone() });
        let (splitter, _result) = SplittingTransformer::new(upstream);
        let parts = Recorder::<Arc<PartTransformer<u16, ()>>>::new(1).shared();
        splitter.subscribe(parts.clone());
        let part = parts.items().remove(0);

        let body = SimplePublisher::<Bytes>::new();
        let done = part.prepare();
        part.on_response(206);
        part.on_stream(Arc::new(body.clone()));
        for chunk in ["a", "b", "c"] {
            let _ = body.send(Bytes::from(chunk));
        }

        let outcome = tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .expect("part future must resolve once the channel is cancelled");
        assert!(matches!(outcome, Err(StreamError::Cancelled(_))));
        assert!(body.is_cancelled());
        assert_eq!(sink.items(), vec![Bytes::from("a")]);
        assert!(!sink.is_terminated());
        sink.assert_well_formed();
    }

    #[test]
    fn second_subscriber_is_rejected() {
        let upstream: Arc<dyn ResponseTransformer<u16, ResponseBytes<u16>>> =
            Arc::new(BytesTransformer::new());
        let (splitter, _result) = SplittingTransformer::new(upstream);
        splitter.subscribe(Recorder::<Parts>::new(0).shared());
        let second = Recorder::<Parts>::new(0).shared();
        splitter.subscribe(second.clone());
        assert!(matches!(second.error(), Some(StreamError::ProtocolViolation(_))));
    }
}
