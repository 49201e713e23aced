//! Cutting one request body into a stream of part bodies.
//!
//! The source is pulled one fragment at a time. Each fragment is cut at
//! part boundaries and forwarded into the current [`SplitPart`]. Bytes
//! forwarded into a part count against the buffer ceiling until that
//! part's subscriber has received them; the source is only asked for more
//! while the count is below the ceiling, so memory stays bounded however
//! fast the source is.
//!
//! With a known source length every part's size is fixed up front and the
//! part is published as soon as it is started. Otherwise a part is only
//! published once it is full (or the source ended), so its length is known
//! before anyone sends it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, trace, warn};
use warpstream_core::sync::lock;
use warpstream_core::{
    reject, Publisher, RequestBody, SimplePublisher, SplitConfig, StreamError, StreamResult,
    Subscriber, Subscription,
};

use crate::part::SplitPart;

/// Publishes the parts of `upstream` in order. Single subscriber.
pub struct SplittingPublisher {
    upstream: Arc<dyn RequestBody>,
    config: SplitConfig,
    subscribed: AtomicBool,
}

impl SplittingPublisher {
    pub fn new(upstream: Arc<dyn RequestBody>, config: SplitConfig) -> StreamResult<Self> {
        config
            .validate()
            .map_err(|e| StreamError::IllegalArgument(e.to_string()))?;
        Ok(Self {
            upstream,
            config,
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SplitConfig {
        &self.config
    }
}

impl Publisher<Arc<SplitPart>> for SplittingPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Arc<SplitPart>>>) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            reject(
                subscriber.as_ref(),
                StreamError::ProtocolViolation("a split body can only be subscribed once".into()),
            );
            return;
        }
        let total = self.upstream.content_length();
        debug!(
            total = ?total,
            part_size = self.config.part_size,
            buffer_size = self.config.buffer_size,
            retryable = self.config.retryable,
            "splitting body"
        );
        let splitter = Splitter::new(self.config.clone(), total);
        let weak = Arc::downgrade(&splitter);
        splitter.parts.on_cancel(move || {
            if let Some(splitter) = weak.upgrade() {
                splitter.on_downstream_cancel();
            }
        });
        splitter.parts.subscribe(Arc::new(Announcing {
            downstream: subscriber,
        }));
        self.upstream.subscribe(splitter);
    }
}

/// Marks each part as seen before the downstream subscriber gets it.
struct Announcing {
    downstream: Arc<dyn Subscriber<Arc<SplitPart>>>,
}

impl Subscriber<Arc<SplitPart>> for Announcing {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&self, part: Arc<SplitPart>) {
        part.mark_announced();
        self.downstream.on_next(part);
    }

    fn on_error(&self, error: StreamError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&self) {
        self.downstream.on_complete();
    }
}

struct PartWriter {
    part: Arc<SplitPart>,
    filled: u64,
}

#[derive(Default)]
struct SplitState {
    upstream: Option<Arc<dyn Subscription>>,
    current: Option<PartWriter>,
    parts_started: u32,
    /// Bytes assigned to parts so far.
    received: u64,
    upstream_done: bool,
    downstream_cancelled: bool,
    finished: bool,
}

/// Side effects decided under the state lock and run after releasing it.
enum Action {
    Publish(Arc<SplitPart>),
    Push(Arc<SplitPart>, Bytes),
    Seal(Arc<SplitPart>, u64),
    FailPart(Arc<SplitPart>, StreamError),
    CompleteParts,
    FailParts(StreamError),
    CancelUpstream(Arc<dyn Subscription>),
}

struct Splitter {
    this: Weak<Self>,
    config: SplitConfig,
    total: Option<u64>,
    parts: SimplePublisher<Arc<SplitPart>>,
    state: Mutex<SplitState>,
    /// Bytes pushed into parts and not yet received by their subscribers.
    buffered: AtomicU64,
    upstream_requested: AtomicBool,
}

impl Splitter {
    fn new(config: SplitConfig, total: Option<u64>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            total,
            parts: SimplePublisher::new(),
            state: Mutex::new(SplitState::default()),
            buffered: AtomicU64::new(0),
            upstream_requested: AtomicBool::new(false),
        })
    }

    fn maybe_request(&self) {
        let upstream = {
            let state = lock(&self.state);
            if state.upstream_done || state.finished {
                return;
            }
            state.upstream.clone()
        };
        let Some(upstream) = upstream else {
            return;
        };
        if self.buffered.load(Ordering::Acquire) >= self.config.buffer_size {
            trace!(buffered = self.buffered.load(Ordering::Relaxed), "split buffer full");
            return;
        }
        if self
            .upstream_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            upstream.request(1);
        }
    }

    fn release(&self, len: u64) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
        self.maybe_request();
    }

    fn start_part(&self, state: &mut SplitState, actions: &mut Vec<Action>) -> Arc<SplitPart> {
        state.parts_started += 1;
        let max_length = match self.total {
            Some(total) => self.config.part_size.min(total - state.received),
            None => self.config.part_size,
        };
        let part = Arc::new(SplitPart::new(
            state.parts_started,
            max_length,
            self.total.is_some(),
            self.config.retryable,
        ));
        trace!(part = state.parts_started, max_length, "starting part");
        if self.total.is_some() {
            actions.push(Action::Publish(part.clone()));
        }
        state.current = Some(PartWriter {
            part: part.clone(),
            filled: 0,
        });
        part
    }

    fn finish_part(&self, state: &mut SplitState, actions: &mut Vec<Action>) {
        let Some(writer) = state.current.take() else {
            return;
        };
        actions.push(Action::Seal(writer.part.clone(), writer.filled));
        if self.total.is_none() {
            actions.push(Action::Publish(writer.part));
        }
    }

    /// Stop pulling from the source once the downstream has gone.
    fn stop(&self, state: &mut SplitState, actions: &mut Vec<Action>) {
        state.finished = true;
        if let Some(upstream) = state.upstream.take() {
            actions.push(Action::CancelUpstream(upstream));
        }
    }

    fn split(&self, state: &mut SplitState, mut fragment: Bytes, actions: &mut Vec<Action>) {
        if let Some(total) = self.total {
            if state.received + fragment.len() as u64 > total {
                let error = StreamError::DataIntegrity(format!(
                    "body produced more than its declared {total} bytes"
                ));
                self.fail(state, error, actions);
                return;
            }
        }

        while !fragment.is_empty() {
            let part = if let Some(writer) = &state.current {
                writer.part.clone()
            } else if state.downstream_cancelled {
                self.stop(state, actions);
                return;
            } else {
                self.start_part(state, actions)
            };
            let Some(writer) = state.current.as_mut() else {
                return;
            };
            let room = (part.max_length() - writer.filled) as usize;
            let piece = fragment.split_to(room.min(fragment.len()));
            let len = piece.len() as u64;
            writer.filled += len;
            state.received += len;
            self.buffered.fetch_add(len, Ordering::AcqRel);
            actions.push(Action::Push(part.clone(), piece));

            if writer.filled == part.max_length() {
                self.finish_part(state, actions);
                if state.downstream_cancelled {
                    self.stop(state, actions);
                    return;
                }
            }
        }
    }

    fn fail(&self, state: &mut SplitState, error: StreamError, actions: &mut Vec<Action>) {
        warn!(error = %error, "split failed");
        if let Some(writer) = state.current.take() {
            actions.push(Action::FailPart(writer.part, error.clone()));
        }
        if let Some(upstream) = state.upstream.take() {
            actions.push(Action::CancelUpstream(upstream));
        }
        state.finished = true;
        actions.push(Action::FailParts(error));
    }

    fn run(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Publish(part) => self.parts.send_with(part, Box::new(|_| {})),
                Action::Push(part, piece) => {
                    let len = piece.len() as u64;
                    let this = self.this.clone();
                    part.push(
                        piece,
                        Box::new(move |_| {
                            if let Some(this) = this.upgrade() {
                                this.release(len);
                            }
                        }),
                    );
                }
                Action::Seal(part, length) => part.seal(length),
                Action::FailPart(part, error) => part.fail(error),
                Action::CompleteParts => {
                    let _ = self.parts.complete();
                }
                Action::FailParts(error) => {
                    let _ = self.parts.error(error);
                }
                Action::CancelUpstream(upstream) => upstream.cancel(),
            }
        }
    }

    fn on_downstream_cancel(&self) {
        let mut actions = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.downstream_cancelled = true;
            let current_announced = state
                .current
                .as_ref()
                .is_some_and(|writer| writer.part.is_announced());
            if current_announced {
                debug!("parts cancelled; finishing the part in flight");
            } else {
                debug!("parts cancelled");
                state.current = None;
                self.stop(&mut state, &mut actions);
            }
        }
        self.run(actions);
    }
}

impl Subscriber<Bytes> for Splitter {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let accepted = {
            let mut state = lock(&self.state);
            if state.upstream.is_some() || state.finished {
                false
            } else {
                state.upstream = Some(subscription.clone());
                true
            }
        };
        if !accepted {
            subscription.cancel();
            return;
        }
        self.maybe_request();
    }

    fn on_next(&self, fragment: Bytes) {
        self.upstream_requested.store(false, Ordering::Release);
        let mut actions = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            self.split(&mut state, fragment, &mut actions);
        }
        self.run(actions);
        self.maybe_request();
    }

    fn on_error(&self, error: StreamError) {
        let mut actions = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.upstream_done = true;
            state.upstream = None;
            self.fail(&mut state, error, &mut actions);
        }
        self.run(actions);
    }

    fn on_complete(&self) {
        let mut actions = Vec::new();
        {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.upstream_done = true;
            state.upstream = None;
            match self.total {
                Some(total) if state.received < total => {
                    let error = StreamError::DataIntegrity(format!(
                        "body ended after {} of its declared {total} bytes",
                        state.received
                    ));
                    self.fail(&mut state, error, &mut actions);
                }
                _ => {
                    if state.current.is_none() && state.parts_started == 0 {
                        // An empty source still yields one (empty) part.
                        self.start_part(&mut state, &mut actions);
                    }
                    self.finish_part(&mut state, &mut actions);
                    state.finished = true;
                    trace!(parts = state.parts_started, "split complete");
                    actions.push(Action::CompleteParts);
                }
            }
        }
        self.run(actions);
    }
}
