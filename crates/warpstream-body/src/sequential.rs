//! A subscriber that handles one item at a time and resolves a single result.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tracing::debug;
use warpstream_core::sync::lock;
use warpstream_core::{
    completion, Completion, Publisher, StreamError, StreamResult, Subscriber, Subscription,
};

type Consumer<T> = Box<dyn FnMut(T) -> StreamResult<()> + Send>;
type Finish<O> = Box<dyn FnOnce(StreamResult<()>) -> Option<StreamResult<O>> + Send>;
/// Receives the final result exactly once.
pub type ResultCallback<O> = Box<dyn FnOnce(StreamResult<O>) + Send>;

/// Requests one item, hands it to the consumer, and only then requests the
/// next. A consumer error cancels the subscription and fails the result.
pub struct SequentialSubscriber<T, O = ()> {
    consumer: Mutex<Option<Consumer<T>>>,
    finish: Mutex<Option<(Finish<O>, ResultCallback<O>)>>,
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> SequentialSubscriber<T, ()> {
    pub fn new(
        consumer: impl FnMut(T) -> StreamResult<()> + Send + 'static,
    ) -> (Arc<Self>, Completion<()>) {
        let (completer, completion) = completion();
        let subscriber = Self::with_callback(
            consumer,
            |result| Some(result),
            Box::new(move |result| {
                completer.finish(result);
            }),
        );
        (subscriber, completion)
    }
}

impl<T: Send + 'static, O: Send + 'static> SequentialSubscriber<T, O> {
    /// `finish` turns the stream outcome into the final result; `done`
    /// receives it.
    pub fn with_callback(
        consumer: impl FnMut(T) -> StreamResult<()> + Send + 'static,
        finish: impl FnOnce(StreamResult<()>) -> Option<StreamResult<O>> + Send + 'static,
        done: ResultCallback<O>,
    ) -> Arc<Self> {
        Arc::new(Self {
            consumer: Mutex::new(Some(Box::new(consumer))),
            finish: Mutex::new(Some((Box::new(finish), done))),
            subscription: Mutex::new(None),
        })
    }

    fn resolve(&self, outcome: StreamResult<()>) {
        lock(&self.consumer).take();
        lock(&self.subscription).take();
        let Some((finish, done)) = lock(&self.finish).take() else {
            return;
        };
        if let Some(result) = finish(outcome) {
            done(result);
        }
    }
}

impl<T: Send + 'static, O: Send + 'static> Subscriber<T> for SequentialSubscriber<T, O> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut current = lock(&self.subscription);
            if current.is_some() || lock(&self.finish).is_none() {
                drop(current);
                subscription.cancel();
                return;
            }
            *current = Some(subscription.clone());
        }
        subscription.request(1);
    }

    fn on_next(&self, item: T) {
        let result = match lock(&self.consumer).as_mut() {
            Some(consumer) => consumer(item),
            None => return,
        };
        let subscription = lock(&self.subscription).clone();
        match result {
            Ok(()) => {
                if let Some(subscription) = subscription {
                    subscription.request(1);
                }
            }
            Err(error) => {
                debug!(error = %error, "consumer failed; cancelling stream");
                if let Some(subscription) = subscription {
                    subscription.cancel();
                }
                self.resolve(Err(error));
            }
        }
    }

    fn on_error(&self, error: StreamError) {
        self.resolve(Err(error));
    }

    fn on_complete(&self) {
        self.resolve(Ok(()));
    }
}

/// Subscribe to `publisher` and gather every chunk into one buffer.
pub fn collect_bytes(publisher: &dyn Publisher<Bytes>) -> Completion<Bytes> {
    let (completer, completion) = completion();
    publisher.subscribe(collector(Box::new(move |result| {
        completer.finish(result);
    })));
    completion
}

/// A sequential subscriber that accumulates bytes and reports them to `done`.
pub(crate) fn collector(done: ResultCallback<Bytes>) -> Arc<SequentialSubscriber<Bytes, Bytes>> {
    let buffer = Arc::new(Mutex::new(BytesMut::new()));
    let sink = buffer.clone();
    SequentialSubscriber::with_callback(
        move |chunk: Bytes| {
            lock(&sink).extend_from_slice(&chunk);
            Ok(())
        },
        move |outcome| Some(outcome.map(|()| std::mem::take(&mut *lock(&buffer)).freeze())),
        done,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BytesBody;
    use warpstream_core::SimplePublisher;

    #[tokio::test]
    async fn collects_every_chunk() {
        let body = BytesBody::from_buffers([Bytes::from("ab"), Bytes::from("cd"), Bytes::from("e")]);
        let bytes = collect_bytes(&body).await.unwrap();
        assert_eq!(bytes, Bytes::from("abcde"));
    }

    #[tokio::test]
    async fn stream_error_fails_result() {
        let publisher = SimplePublisher::<Bytes>::new();
        let result = collect_bytes(&publisher);
        let _ = publisher.send(Bytes::from("partial"));
        let _ = publisher.error(StreamError::Client("reset".into()));
        assert!(matches!(result.await, Err(StreamError::Client(_))));
    }

    #[tokio::test]
    async fn consumer_error_cancels_upstream() {
        let publisher = SimplePublisher::<u32>::new();
        let (subscriber, done) = SequentialSubscriber::new(|item: u32| {
            if item > 1 {
                Err(StreamError::Callback(format!("refusing {item}")))
            } else {
                Ok(())
            }
        });
        publisher.subscribe(subscriber);
        let _ = publisher.send(1);
        let _ = publisher.send(2);

        assert!(matches!(done.await, Err(StreamError::Callback(_))));
        assert!(publisher.is_cancelled());
    }

    #[test]
    fn requests_one_at_a_time() {
        let publisher = SimplePublisher::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (subscriber, mut done) = SequentialSubscriber::new(move |item: u32| {
            lock(&sink).push(item);
            Ok(())
        });
        publisher.subscribe(subscriber);
        for i in 0..5 {
            let mut delivered = publisher.send(i);
            assert!(delivered.try_result().unwrap().is_ok());
        }
        let _ = publisher.complete();
        assert_eq!(*lock(&seen), vec![0, 1, 2, 3, 4]);
        assert!(done.try_result().unwrap().is_ok());
    }
}
