//! A body filled once and then replayed to any number of subscribers.

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, trace};
use warpstream_core::sync::lock;
use warpstream_core::{
    reject, DemandSubscription, Publisher, RequestBody, SliceGenerator, StreamError, StreamResult,
    Subscriber,
};

type Cursor = DemandSubscription<Bytes, SliceGenerator<Bytes>>;

enum Phase {
    Filling(Vec<Bytes>),
    Ready(Arc<[Bytes]>),
    Closed,
}

struct State {
    phase: Phase,
    cursors: Vec<Weak<Cursor>>,
}

/// Buffers chunks pushed with [`send`](Self::send) until
/// [`complete`](Self::complete), then serves the same chunk list to every
/// subscriber through an independent cursor.
///
/// Subscribing before completion or after [`close`](Self::close) errors the
/// subscriber without emitting anything.
pub struct BufferingReplayableBody {
    declared_length: Option<u64>,
    state: Mutex<State>,
}

impl BufferingReplayableBody {
    pub fn new(content_length: Option<u64>) -> Self {
        Self {
            declared_length: content_length,
            state: Mutex::new(State {
                phase: Phase::Filling(Vec::new()),
                cursors: Vec::new(),
            }),
        }
    }

    pub fn send(&self, chunk: Bytes) -> StreamResult<()> {
        match &mut lock(&self.state).phase {
            Phase::Filling(chunks) => {
                if !chunk.is_empty() {
                    chunks.push(chunk);
                }
                Ok(())
            }
            Phase::Ready(_) => Err(StreamError::ProtocolViolation(
                "cannot send to a body that has already been completed".into(),
            )),
            Phase::Closed => Err(StreamError::ProtocolViolation(
                "cannot send to a body that has been closed".into(),
            )),
        }
    }

    /// Freeze the buffered chunks. Later calls are no-ops.
    pub fn complete(&self) {
        let mut state = lock(&self.state);
        if let Phase::Filling(chunks) = &mut state.phase {
            let chunks: Arc<[Bytes]> = std::mem::take(chunks).into();
            trace!(chunks = chunks.len(), "replayable body complete");
            state.phase = Phase::Ready(chunks);
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(lock(&self.state).phase, Phase::Ready(_))
    }

    /// Release the buffer and fail every active subscriber. Idempotent.
    pub fn close(&self) {
        let cursors = {
            let mut state = lock(&self.state);
            if matches!(state.phase, Phase::Closed) {
                return;
            }
            state.phase = Phase::Closed;
            std::mem::take(&mut state.cursors)
        };
        debug!(active = cursors.len(), "closing replayable body");
        for cursor in cursors.iter().filter_map(Weak::upgrade) {
            cursor.fail(closed_error());
        }
    }

    fn buffered_length(&self) -> Option<u64> {
        match &lock(&self.state).phase {
            Phase::Ready(chunks) => Some(chunks.iter().map(|c| c.len() as u64).sum()),
            _ => None,
        }
    }
}

fn closed_error() -> StreamError {
    StreamError::NonRetryable("the replay buffer of this body has been released".into())
}

impl Publisher<Bytes> for BufferingReplayableBody {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let chunks = match &lock(&self.state).phase {
            Phase::Filling(_) => Err(StreamError::ProtocolViolation(
                "body cannot be subscribed before it has been completed".into(),
            )),
            Phase::Ready(chunks) => Ok(chunks.clone()),
            Phase::Closed => Err(closed_error()),
        };
        let chunks = match chunks {
            Ok(chunks) => chunks,
            Err(error) => {
                reject(subscriber.as_ref(), error);
                return;
            }
        };

        let cursor = DemandSubscription::subscribe(subscriber, SliceGenerator::new(chunks));
        if cursor.is_terminated() {
            return;
        }
        let closed = {
            let mut state = lock(&self.state);
            state.cursors.retain(|c| c.strong_count() > 0);
            let closed = matches!(state.phase, Phase::Closed);
            if !closed {
                state.cursors.push(Arc::downgrade(&cursor));
            }
            closed
        };
        if closed {
            cursor.fail(closed_error());
        }
    }
}

impl RequestBody for BufferingReplayableBody {
    fn content_length(&self) -> Option<u64> {
        self.declared_length.or_else(|| self.buffered_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warpstream_core::testing::Recorder;

    fn completed(chunks: &[&'static str]) -> BufferingReplayableBody {
        let body = BufferingReplayableBody::new(None);
        for chunk in chunks.iter().copied() {
            body.send(Bytes::from_static(chunk.as_bytes())).unwrap();
        }
        body.complete();
        body
    }

    #[test]
    fn subscribers_replay_independently() {
        let body = completed(&["c1", "c2", "c3"]);
        let fast = Recorder::<Bytes>::new(10).shared();
        let slow = Recorder::<Bytes>::new(1).shared();
        body.subscribe(fast.clone());
        body.subscribe(slow.clone());

        assert!(fast.is_complete());
        assert_eq!(slow.items(), vec![Bytes::from("c1")]);
        slow.request(1);
        assert_eq!(slow.items().len(), 2);
        slow.request(5);
        assert!(slow.is_complete());
        assert_eq!(fast.items(), slow.items());
        fast.assert_well_formed();
        slow.assert_well_formed();
    }

    #[test]
    fn subscribe_before_complete_is_rejected() {
        let body = BufferingReplayableBody::new(Some(4));
        body.send(Bytes::from("data")).unwrap();
        let recorder = Recorder::<Bytes>::new(1).shared();
        body.subscribe(recorder.clone());
        assert!(matches!(recorder.error(), Some(StreamError::ProtocolViolation(_))));
        assert!(recorder.items().is_empty());
        assert_eq!(body.content_length(), Some(4));
    }

    #[test]
    fn send_after_complete_or_close_fails() {
        let body = completed(&["a"]);
        assert!(matches!(body.send(Bytes::from("b")), Err(StreamError::ProtocolViolation(_))));
        body.close();
        assert!(matches!(body.send(Bytes::from("b")), Err(StreamError::ProtocolViolation(_))));
    }

    #[test]
    fn close_fails_active_cursors_and_later_subscribers() {
        let body = completed(&["a", "b"]);
        let active = Recorder::<Bytes>::new(1).shared();
        body.subscribe(active.clone());

        body.close();
        body.close();
        assert!(matches!(active.error(), Some(StreamError::NonRetryable(_))));
        active.assert_well_formed();

        let late = Recorder::<Bytes>::new(1).shared();
        body.subscribe(late.clone());
        assert!(matches!(late.error(), Some(StreamError::NonRetryable(_))));
        assert!(late.items().is_empty());
    }

    #[test]
    fn length_is_known_once_complete() {
        let body = BufferingReplayableBody::new(None);
        body.send(Bytes::from("abc")).unwrap();
        assert_eq!(body.content_length(), None);
        body.complete();
        assert_eq!(body.content_length(), Some(3));
    }
}
