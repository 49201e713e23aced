//! Part bodies produced by the splitting publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};
use warpstream_body::BufferingReplayableBody;
use warpstream_core::sync::lock;
use warpstream_core::{
    reject, DeliveryCallback, Publisher, RequestBody, SimplePublisher, StreamError, Subscriber,
};

/// One part of a split body.
///
/// The first subscription receives the bytes live as they are cut from the
/// source. What happens on a later subscription (a retry of the part's
/// request) depends on how the part was built:
///
/// - a *retryable* part keeps every fragment it forwarded and replays them
///   until [`close`](SplitPart::close) releases the copy;
/// - a *non-retryable* part keeps nothing and fails the resubscription with
///   [`StreamError::NonRetryable`].
pub struct SplitPart {
    part_number: u32,
    max_length: u64,
    length_known: bool,
    live: SimplePublisher<Bytes>,
    live_taken: AtomicBool,
    replay: Option<BufferingReplayableBody>,
    sealed_length: Mutex<Option<u64>>,
    announced: AtomicBool,
}

impl SplitPart {
    pub(crate) fn new(part_number: u32, max_length: u64, length_known: bool, retryable: bool) -> Self {
        Self {
            part_number,
            max_length,
            length_known,
            live: SimplePublisher::new(),
            live_taken: AtomicBool::new(false),
            replay: retryable.then(|| BufferingReplayableBody::new(None)),
            sealed_length: Mutex::new(None),
            announced: AtomicBool::new(false),
        }
    }

    /// 1-based position of this part in the source.
    pub fn part_number(&self) -> u32 {
        self.part_number
    }

    /// Upper bound on this part's length; exact when the source length was
    /// known.
    pub fn max_length(&self) -> u64 {
        self.max_length
    }

    /// Whether the source declared its length, fixing every part's size up
    /// front.
    pub fn content_length_known(&self) -> bool {
        self.length_known
    }

    pub fn is_retryable(&self) -> bool {
        self.replay.is_some()
    }

    /// Release the replay copy. Later resubscriptions fail as non-retryable.
    pub fn close(&self) {
        if let Some(replay) = &self.replay {
            trace!(part = self.part_number, "releasing part replay buffer");
            replay.close();
        }
    }

    pub(crate) fn push(&self, fragment: Bytes, delivered: DeliveryCallback) {
        if let Some(replay) = &self.replay {
            // Only fails once closed, and a closed part has nothing to replay.
            let _ = replay.send(fragment.clone());
        }
        self.live.send_with(fragment, delivered);
    }

    pub(crate) fn seal(&self, length: u64) {
        *lock(&self.sealed_length) = Some(length);
        if let Some(replay) = &self.replay {
            replay.complete();
        }
        let _ = self.live.complete();
    }

    pub(crate) fn fail(&self, error: StreamError) {
        debug!(part = self.part_number, error = %error, "part failed");
        if let Some(replay) = &self.replay {
            replay.close();
        }
        let _ = self.live.error(error);
    }

    pub(crate) fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    pub(crate) fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SplitPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitPart")
            .field("part_number", &self.part_number)
            .field("max_length", &self.max_length)
            .field("length_known", &self.length_known)
            .field("retryable", &self.is_retryable())
            .finish()
    }
}

impl Publisher<Bytes> for SplitPart {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        if !self.live_taken.swap(true, Ordering::AcqRel) {
            self.live.subscribe(subscriber);
            return;
        }
        match &self.replay {
            Some(replay) => {
                debug!(part = self.part_number, "replaying buffered part");
                replay.subscribe(subscriber);
            }
            None => reject(
                subscriber.as_ref(),
                StreamError::NonRetryable(format!(
                    "part {} was streamed without buffering and cannot be resubscribed",
                    self.part_number
                )),
            ),
        }
    }
}

impl RequestBody for SplitPart {
    fn content_length(&self) -> Option<u64> {
        if self.length_known {
            Some(self.max_length)
        } else {
            *lock(&self.sealed_length)
        }
    }
}
