//! Request-side splitting against real bodies.
//!
//! - split/recombine identity across boundary sizes
//! - cancelling the part stream mid-way
//! - the buffered-byte ceiling pausing the source

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use warpstream_body::BytesBody;
use warpstream_core::sync::lock;
use warpstream_core::testing::Recorder;
use warpstream_core::{
    Completion, Publisher, RequestBody, SimplePublisher, SplitConfig, StreamError, Subscriber,
    Subscription, UNBOUNDED,
};
use warpstream_multipart::{SplitPart, SplittingPublisher};

/// Subscribes to every part as soon as it arrives and records its bytes.
struct PartCollector {
    cancel_after: Option<usize>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    parts: Mutex<Vec<(Arc<SplitPart>, Arc<Recorder<Bytes>>)>>,
    outcome: Mutex<Option<Result<(), StreamError>>>,
}

impl PartCollector {
    fn new(cancel_after: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            cancel_after,
            subscription: Mutex::new(None),
            parts: Mutex::new(Vec::new()),
            outcome: Mutex::new(None),
        })
    }

    fn parts(&self) -> Vec<(Arc<SplitPart>, Arc<Recorder<Bytes>>)> {
        lock(&self.parts).clone()
    }

    fn recombined(&self) -> Bytes {
        let mut out = BytesMut::new();
        for (_, bytes) in self.parts() {
            assert!(bytes.is_complete(), "part did not complete: {:?}", bytes.error());
            out.extend_from_slice(&bytes.concat());
        }
        out.freeze()
    }
}

impl Subscriber<Arc<SplitPart>> for PartCollector {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        *lock(&self.subscription) = Some(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&self, part: Arc<SplitPart>) {
        let bytes = Recorder::<Bytes>::new(UNBOUNDED).shared();
        part.subscribe(bytes.clone());
        let count = {
            let mut parts = lock(&self.parts);
            parts.push((part, bytes));
            parts.len()
        };
        let subscription = lock(&self.subscription).clone();
        let Some(subscription) = subscription else {
            return;
        };
        if self.cancel_after.is_some_and(|limit| count >= limit) {
            subscription.cancel();
        } else {
            subscription.request(1);
        }
    }

    fn on_error(&self, error: StreamError) {
        *lock(&self.outcome) = Some(Err(error));
    }

    fn on_complete(&self) {
        *lock(&self.outcome) = Some(Ok(()));
    }
}

/// Hides the wrapped body's length.
struct Unsized(BytesBody);

impl Publisher<Bytes> for Unsized {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        self.0.subscribe(subscriber);
    }
}

impl RequestBody for Unsized {
    fn content_length(&self) -> Option<u64> {
        None
    }
}

/// A body fed by hand, with a declared length.
struct Pushed {
    publisher: SimplePublisher<Bytes>,
    length: u64,
}

impl Publisher<Bytes> for Pushed {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        self.publisher.subscribe(subscriber);
    }
}

impl RequestBody for Pushed {
    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }
}

fn source(size: usize, fragment: usize) -> BytesBody {
    let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
    BytesBody::from_buffers(data.chunks(fragment.max(1)).map(Bytes::copy_from_slice))
}

fn split_config(part_size: u64, buffer_size: u64, retryable: bool) -> SplitConfig {
    SplitConfig {
        part_size,
        buffer_size,
        retryable,
    }
}

#[test]
fn split_and_recombine_is_identity() {
    const K: u64 = 4;
    for size in [0usize, 3, 8, 10, 37] {
        for known in [true, false] {
            for retryable in [true, false] {
                let body = source(size, 3);
                let expected: Bytes = {
                    let mut all = BytesMut::new();
                    body.buffers().iter().for_each(|b| all.extend_from_slice(b));
                    all.freeze()
                };
                let upstream: Arc<dyn RequestBody> = if known {
                    Arc::new(body)
                } else {
                    Arc::new(Unsized(body))
                };
                let publisher =
                    SplittingPublisher::new(upstream, split_config(K, 8, retryable)).unwrap();
                let collector = PartCollector::new(None);
                publisher.subscribe(collector.clone());

                let label = format!("size {size}, known {known}, retryable {retryable}");
                assert!(matches!(*lock(&collector.outcome), Some(Ok(()))), "{label}");
                assert_eq!(collector.recombined(), expected, "{label}");

                let parts = collector.parts();
                let expected_parts = (size as u64).div_ceil(K).max(1) as usize;
                assert_eq!(parts.len(), expected_parts, "{label}");
                for (index, (part, bytes)) in parts.iter().enumerate() {
                    assert_eq!(part.part_number() as usize, index + 1);
                    assert_eq!(part.content_length(), Some(bytes.concat().len() as u64));
                    assert_eq!(part.content_length_known(), known);
                }
            }
        }
    }
}

#[test]
fn small_split_cancelled_after_second_part() {
    let publisher =
        SplittingPublisher::new(Arc::new(source(10, 1)), split_config(4, 8, true)).unwrap();
    let collector = PartCollector::new(Some(2));
    publisher.subscribe(collector.clone());

    let parts = collector.parts();
    assert_eq!(parts.len(), 2, "part 3 must not be delivered");
    let sizes: Vec<_> = parts.iter().map(|(p, _)| p.content_length()).collect();
    assert_eq!(sizes, vec![Some(4), Some(4)]);
    // The part in flight at cancellation still finishes.
    assert!(parts[1].1.is_complete());
    assert_eq!(parts[1].1.concat(), Bytes::from(vec![4u8, 5, 6, 7]));
    assert!(lock(&collector.outcome).is_none());
}

fn count_delivered(sent: &mut [Completion<()>], delivered: &mut [bool]) -> usize {
    for (completion, done) in sent.iter_mut().zip(delivered.iter_mut()) {
        if !*done {
            *done = matches!(completion.try_result(), Some(Ok(())));
        }
    }
    delivered.iter().filter(|d| **d).count()
}

#[test]
fn unconsumed_parts_pause_the_source_at_the_ceiling() {
    let feed = SimplePublisher::<Bytes>::new();
    let body = Pushed {
        publisher: feed.clone(),
        length: 16,
    };
    let publisher = SplittingPublisher::new(Arc::new(body), split_config(4, 8, false)).unwrap();
    let parts = Recorder::<Arc<SplitPart>>::new(UNBOUNDED).shared();
    publisher.subscribe(parts.clone());

    let mut sent: Vec<Completion<()>> =
        (0..16u8).map(|i| feed.send(Bytes::from(vec![i]))).collect();
    let _ = feed.complete();
    let mut delivered = vec![false; sent.len()];
    assert_eq!(count_delivered(&mut sent, &mut delivered), 8);

    assert_eq!(parts.items().len(), 2, "a part is announced when its first byte arrives");

    let first = Recorder::<Bytes>::new(UNBOUNDED).shared();
    parts.items()[0].subscribe(first.clone());
    assert!(first.is_complete());
    assert_eq!(count_delivered(&mut sent, &mut delivered), 12);
    assert_eq!(parts.items().len(), 3);

    let second = Recorder::<Bytes>::new(UNBOUNDED).shared();
    parts.items()[1].subscribe(second.clone());
    assert!(second.is_complete());
    assert_eq!(count_delivered(&mut sent, &mut delivered), 16);

    let announced = parts.items();
    assert_eq!(announced.len(), 4);
    for part in &announced[2..] {
        let bytes = Recorder::<Bytes>::new(UNBOUNDED).shared();
        part.subscribe(bytes.clone());
        assert!(bytes.is_complete());
        assert_eq!(bytes.concat().len(), 4);
    }
    assert!(parts.is_complete());
}
