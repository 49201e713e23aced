//! Backpressure-aware publisher/subscriber primitives for byte-stream bodies.
//!
//! Everything in the warpstream workspace speaks the contract in
//! [`reactive`]: a [`Publisher`] hands a [`Subscription`] to each
//! [`Subscriber`], and items only flow against demand granted through
//! [`Subscription::request`].
//!
//! # Building blocks
//!
//! - [`DemandSubscription`] turns a [`Generator`] into a well-behaved,
//!   re-entrancy-safe subscription. Pull-driven sources are built on it.
//! - [`SimplePublisher`] is the push-style counterpart: producers `send`
//!   items and are told when each one reached the subscriber.
//! - [`StagePublisher`] runs a per-item [`Stage`] between an upstream and
//!   a downstream, emitting zero or more outputs per input without
//!   overrunning downstream demand.
//! - [`ChunkBuffer`] re-cuts arbitrarily fragmented bytes into fixed-size
//!   chunks.
//!
//! # Memory Guarantee
//!
//! Chunks are `bytes::Bytes`, so fan-out and slicing never copy payload.
//! Operators request upstream one item at a time, bounding what is held
//! between stages to the outputs of a single input.

mod chunk;
mod completion;
pub mod config;
mod demand;
mod error;
mod header;
pub mod reactive;
mod simple;
mod stage;
pub mod sync;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use chunk::ChunkBuffer;
pub use completion::{completion, Completer, Completion};
pub use config::{
    BodyConfig, ChecksumAlgorithm, ChecksumConfig, DownloadConfig, SplitConfig, StreamConfig,
};
pub use demand::{DemandSubscription, Generator, ListPublisher, SliceGenerator};
pub use error::{ConfigError, StreamError, StreamResult};
pub use header::{ContentRange, Header, HeaderMap};
pub use reactive::{
    reject, NoopSubscription, Publisher, RequestBody, ResponseTransformer, Subscriber,
    Subscription, DEFAULT_CONTENT_TYPE, UNBOUNDED,
};
pub use simple::{DeliveryCallback, SimplePublisher};
pub use stage::{flatten, map, rechunk, ChunkStage, FlattenStage, MapStage, Stage, StagePublisher};
