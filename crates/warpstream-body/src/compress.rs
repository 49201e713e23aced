//! Per-chunk request compression.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use warpstream_core::{
    ChunkBuffer, Publisher, RequestBody, Stage, StagePublisher, StreamError, StreamResult,
    Subscriber,
};

/// Uncompressed bytes per compressed chunk.
pub const DEFAULT_COMPRESSION_CHUNK_SIZE: usize = 128 * 1024;

pub trait Compressor: Send + Sync {
    /// Value for the `Content-Encoding` header.
    fn content_encoding(&self) -> &str;

    fn compress(&self, chunk: &[u8]) -> StreamResult<Bytes>;
}

/// Gzip, one member per chunk. Concatenated members form a valid gzip stream.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: Compression,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn content_encoding(&self) -> &str {
        "gzip"
    }

    fn compress(&self, chunk: &[u8]) -> StreamResult<Bytes> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(chunk.len() / 2 + 32), self.level);
        encoder
            .write_all(chunk)
            .and_then(|_| encoder.finish())
            .map(Bytes::from)
            .map_err(|e| StreamError::Callback(format!("gzip compression failed: {e}")))
    }
}

/// A body whose chunks are compressed independently. The compressed length
/// is unknown until the body has been streamed.
pub struct CompressionBody {
    inner: Arc<dyn RequestBody>,
    compressor: Arc<dyn Compressor>,
    chunk_size: usize,
}

impl CompressionBody {
    pub fn new(inner: Arc<dyn RequestBody>, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            inner,
            compressor,
            chunk_size: DEFAULT_COMPRESSION_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk_size must be > 0");
        self.chunk_size = chunk_size;
        self
    }

    pub fn content_encoding(&self) -> &str {
        self.compressor.content_encoding()
    }
}

impl Publisher<Bytes> for CompressionBody {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let compressor = self.compressor.clone();
        let chunk_size = self.chunk_size;
        let upstream: Arc<dyn Publisher<Bytes>> = Arc::new(self.inner.clone());
        let compressed = StagePublisher::new(upstream, move || CompressStage {
            buffer: ChunkBuffer::new(chunk_size, None),
            compressor: compressor.clone(),
        });
        compressed.subscribe(subscriber);
    }
}

impl RequestBody for CompressionBody {
    fn content_length(&self) -> Option<u64> {
        None
    }

    fn content_type(&self) -> &str {
        self.inner.content_type()
    }
}

struct CompressStage {
    buffer: ChunkBuffer,
    compressor: Arc<dyn Compressor>,
}

impl Stage<Bytes, Bytes> for CompressStage {
    fn on_item(&mut self, item: Bytes) -> StreamResult<Vec<Bytes>> {
        self.buffer
            .split(item)
            .iter()
            .map(|chunk| self.compressor.compress(chunk))
            .collect()
    }

    fn on_end(&mut self) -> StreamResult<Vec<Bytes>> {
        self.buffer
            .flush()
            .map(|tail| self.compressor.compress(&tail))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BytesBody;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;
    use warpstream_core::testing::Recorder;

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn chunks_decompress_back_to_source() {
        let data: Vec<u8> = b"the quick brown fox ".iter().copied().cycle().take(5000).collect();
        let source = BytesBody::from_buffers(data.chunks(333).map(Bytes::copy_from_slice));
        let body = CompressionBody::new(Arc::new(source), Arc::new(GzipCompressor::default()))
            .with_chunk_size(1024);
        assert_eq!(body.content_length(), None);
        assert_eq!(body.content_encoding(), "gzip");

        let recorder = Recorder::<Bytes>::new(1).per_item(1).shared();
        body.subscribe(recorder.clone());
        assert!(recorder.is_complete());
        // 4 full chunks plus the flushed tail.
        assert_eq!(recorder.items().len(), 5);
        assert_eq!(gunzip(&recorder.concat()), data);
        for member in recorder.items() {
            assert!(gunzip(&member).len() <= 1024);
        }
    }

    #[test]
    fn compressor_failure_reaches_subscriber() {
        struct Failing;
        impl Compressor for Failing {
            fn content_encoding(&self) -> &str {
                "broken"
            }
            fn compress(&self, _chunk: &[u8]) -> StreamResult<Bytes> {
                Err(StreamError::Callback("compressor exploded".into()))
            }
        }

        let body = CompressionBody::new(Arc::new(BytesBody::from_string("data")), Arc::new(Failing));
        let recorder = Recorder::<Bytes>::new(4).shared();
        body.subscribe(recorder.clone());
        assert!(matches!(recorder.error(), Some(StreamError::Callback(_))));
        recorder.assert_well_formed();
    }

    #[test]
    fn empty_body_emits_nothing() {
        let body = CompressionBody::new(Arc::new(BytesBody::empty()), Arc::new(GzipCompressor::new(9)));
        let recorder = Recorder::<Bytes>::new(1).shared();
        body.subscribe(recorder.clone());
        assert!(recorder.is_complete());
        assert!(recorder.items().is_empty());
    }
}
