//! Prefix/suffix injection around an existing stream.
//!
//! The header is merged into the first item and the footer is emitted as an
//! extra item just before completion. The footer is sent without waiting for
//! demand, so this wrapper is only sound between a publisher and subscriber
//! that are both owned by the caller (e.g. an event-stream body whose
//! consumer always has demand outstanding).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use warpstream_core::sync::lock;
use warpstream_core::{Publisher, StreamError, Subscriber, Subscription};

type Combine<T> = Arc<dyn Fn(T, T) -> T + Send + Sync>;

pub struct EnvelopeWrappedPublisher<T> {
    inner: Arc<dyn Publisher<T>>,
    header: Option<T>,
    footer: Option<T>,
    combine: Combine<T>,
}

impl<T> EnvelopeWrappedPublisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// `combine(header, first)` produces the first emitted item.
    pub fn new(
        inner: Arc<dyn Publisher<T>>,
        header: Option<T>,
        footer: Option<T>,
        combine: impl Fn(T, T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            header,
            footer,
            combine: Arc::new(combine),
        }
    }
}

impl<T> Publisher<T> for EnvelopeWrappedPublisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(Arc::new(EnvelopeSubscriber {
            downstream: subscriber,
            header: Mutex::new(self.header.clone()),
            footer: Mutex::new(self.footer.clone()),
            combine: self.combine.clone(),
            emitted: AtomicBool::new(false),
        }));
    }
}

struct EnvelopeSubscriber<T> {
    downstream: Arc<dyn Subscriber<T>>,
    header: Mutex<Option<T>>,
    footer: Mutex<Option<T>>,
    combine: Combine<T>,
    emitted: AtomicBool,
}

impl<T: Send + Sync + 'static> Subscriber<T> for EnvelopeSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, item: T) {
        self.emitted.store(true, Ordering::Release);
        let header = lock(&self.header).take();
        let item = match header {
            Some(header) => (self.combine)(header, item),
            None => item,
        };
        self.downstream.on_next(item);
    }

    fn on_error(&self, error: StreamError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        if self.emitted.load(Ordering::Acquire) {
            let footer = lock(&self.footer).take();
            if let Some(footer) = footer {
                self.downstream.on_next(footer);
            }
        }
        self.downstream.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use warpstream_core::testing::Recorder;
    use warpstream_core::ListPublisher;

    fn concat(a: Bytes, b: Bytes) -> Bytes {
        let mut out = BytesMut::from(&a[..]);
        out.extend_from_slice(&b);
        out.freeze()
    }

    fn wrapped(items: Vec<Bytes>) -> EnvelopeWrappedPublisher<Bytes> {
        EnvelopeWrappedPublisher::new(
            Arc::new(ListPublisher::new(items)),
            Some(Bytes::from("<")),
            Some(Bytes::from(">")),
            concat,
        )
    }

    #[test]
    fn header_merges_into_first_and_footer_follows_last() {
        let publisher = wrapped(vec![Bytes::from("a"), Bytes::from("b")]);
        let recorder = Recorder::<Bytes>::new(10).shared();
        publisher.subscribe(recorder.clone());
        assert_eq!(
            recorder.items(),
            vec![Bytes::from("<a"), Bytes::from("b"), Bytes::from(">")]
        );
        assert!(recorder.is_complete());
        recorder.assert_well_formed();
    }

    #[test]
    fn empty_stream_gets_no_envelope() {
        let publisher = wrapped(Vec::new());
        let recorder = Recorder::<Bytes>::new(10).shared();
        publisher.subscribe(recorder.clone());
        assert!(recorder.items().is_empty());
        assert!(recorder.is_complete());
    }

    #[test]
    fn each_subscription_gets_its_own_envelope() {
        let publisher = wrapped(vec![Bytes::from("x")]);
        for _ in 0..2 {
            let recorder = Recorder::<Bytes>::new(10).shared();
            publisher.subscribe(recorder.clone());
            assert_eq!(recorder.concat(), Bytes::from("<x>"));
        }
    }
}
