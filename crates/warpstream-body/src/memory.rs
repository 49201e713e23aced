//! In-memory request bodies.

use std::sync::Arc;

use bytes::Bytes;
use warpstream_core::{
    DemandSubscription, Publisher, RequestBody, SliceGenerator, Subscriber, DEFAULT_CONTENT_TYPE,
};

/// A body over one or more immutable buffers.
///
/// Every subscription walks the same buffers from the start, so the body is
/// freely resubscribable. Chunks are `Bytes` views; nothing is copied.
#[derive(Debug, Clone)]
pub struct BytesBody {
    buffers: Arc<[Bytes]>,
    content_length: u64,
    content_type: String,
}

impl BytesBody {
    pub fn from_buffers(buffers: impl IntoIterator<Item = Bytes>) -> Self {
        // Empty buffers carry nothing and would only cost a signal each.
        let buffers: Arc<[Bytes]> = buffers.into_iter().filter(|b| !b.is_empty()).collect();
        let content_length = buffers.iter().map(|b| b.len() as u64).sum();
        Self {
            buffers,
            content_length,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_buffers([bytes.into()])
    }

    pub fn from_string(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::from_bytes(text).with_content_type("text/plain; charset=UTF-8")
    }

    pub fn empty() -> Self {
        Self::from_buffers([])
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn buffers(&self) -> &[Bytes] {
        &self.buffers
    }
}

impl Publisher<Bytes> for BytesBody {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        DemandSubscription::subscribe(subscriber, SliceGenerator::new(self.buffers.clone()));
    }
}

impl RequestBody for BytesBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.content_length)
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }
}
