//! Multipart transfers over warpstream bodies.
//!
//! Request side: [`SplittingPublisher`] cuts one body into a stream of
//! [`SplitPart`] bodies, each uploadable (and, if configured, retryable) on
//! its own, while keeping the bytes held in memory under a ceiling.
//!
//! Response side: [`SplittingTransformer`] hands out one
//! [`PartTransformer`] per ranged response and stitches their bodies back
//! together, in part order, for a single wrapped
//! [`ResponseTransformer`](warpstream_core::ResponseTransformer).

mod part;
mod split;
mod transformer;

pub use part::SplitPart;
pub use split::SplittingPublisher;
pub use transformer::{PartTransformer, SplittingTransformer};
