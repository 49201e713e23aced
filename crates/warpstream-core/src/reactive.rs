//! The minimal publisher/subscriber contract every component speaks.
//!
//! A [`Subscriber`] receives exactly one `on_subscribe`, then zero or more
//! `on_next`, then at most one of `on_error` / `on_complete`. Items are only
//! delivered against demand granted through [`Subscription::request`].
//!
//! All callbacks take `&self`: subscribers are shared as `Arc<dyn Subscriber<T>>`
//! and keep their mutable state behind atomics or narrow mutexes. No
//! component in this workspace holds a lock while invoking a callback, so a
//! subscriber may call `request` or `cancel` synchronously from `on_next`.

use std::sync::Arc;

use bytes::Bytes;

use crate::completion::Completion;
use crate::error::StreamError;

/// Demand value treated as "effectively unbounded". Additions saturate here.
pub const UNBOUNDED: u64 = u64::MAX;

/// Content type reported by bodies that do not know better.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub trait Subscription: Send + Sync {
    /// Grant `n` more items. `n == 0` is a protocol violation reported via `on_error`.
    fn request(&self, n: u64);

    /// Stop delivery. Idempotent; late in-flight signals may still race in.
    fn cancel(&self);
}

pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: StreamError);
    fn on_complete(&self);
}

pub trait Publisher<T>: Send + Sync {
    /// Attach a subscriber. Never panics or returns an error: failures are
    /// delivered through `on_error` after `on_subscribe`.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// A request body: a publisher of byte chunks with optional length metadata.
pub trait RequestBody: Publisher<Bytes> {
    fn content_length(&self) -> Option<u64>;

    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }
}

/// Consumes a streamed response and produces a single result.
///
/// `R` is the response metadata (headers, status, ...) and `O` the final
/// result. `prepare` is called once per attempt before any other method.
pub trait ResponseTransformer<R, O>: Send + Sync {
    fn prepare(&self) -> Completion<O>;
    fn on_response(&self, response: R);
    fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>);
    fn exception_occurred(&self, error: StreamError);
}

/// A subscription that ignores every call. Handed out before rejecting a subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

/// Reject a subscriber: `on_subscribe` with a no-op subscription, then `on_error`.
pub fn reject<T>(subscriber: &dyn Subscriber<T>, error: StreamError) {
    tracing::debug!(error = %error, "rejecting subscriber");
    subscriber.on_subscribe(Arc::new(NoopSubscription));
    subscriber.on_error(error);
}

/// Add `n` to `current`, saturating at [`UNBOUNDED`].
pub fn add_demand(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

impl<T, P> Publisher<T> for Arc<P>
where
    P: Publisher<T> + ?Sized,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (**self).subscribe(subscriber)
    }
}

impl<P> RequestBody for Arc<P>
where
    P: RequestBody + ?Sized,
{
    fn content_length(&self) -> Option<u64> {
        (**self).content_length()
    }

    fn content_type(&self) -> &str {
        (**self).content_type()
    }
}
