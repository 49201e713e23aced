//! aws-chunked framing with a trailing checksum.
//!
//! The wrapped body is re-cut into fixed-size chunks and each chunk is
//! framed as `hex(len)\r\n<data>\r\n`. After the last data chunk comes the
//! terminal chunk `0\r\n`, the trailer `<header>:<base64 digest>\r\n`, and
//! a final `\r\n`. The terminal chunk and trailer are merged into the last
//! emitted item, and a zero-byte body still emits them.
//!
//! The payload length comes from the wrapped body unless it is set
//! explicitly with [`ChecksumCalculatingBody::with_content_length`]. A body
//! that produces more than its own declared length fails with
//! [`StreamError::DataIntegrity`]; bytes beyond an explicit length are
//! dropped, so only the first `content_length` bytes are framed.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use warpstream_core::{
    ChecksumAlgorithm, ChecksumConfig, ChunkBuffer, Publisher, RequestBody, Stage, StagePublisher,
    StreamError, StreamResult, Subscriber,
};

use crate::checksum::{new_checksum, Checksum};

const CRLF: &[u8] = b"\r\n";

/// Exact number of bytes a [`ChecksumCalculatingBody`] emits for a payload
/// of `payload_len` bytes.
pub fn chunked_content_length(
    payload_len: u64,
    chunk_size: usize,
    trailer_header: &str,
    algorithm: ChecksumAlgorithm,
) -> u64 {
    assert!(chunk_size > 0, "chunk_size must be > 0");
    let chunk_size = chunk_size as u64;
    let full_chunks = payload_len / chunk_size;
    let tail = payload_len % chunk_size;

    let mut length = full_chunks * framed_len(chunk_size);
    if tail > 0 {
        length += framed_len(tail);
    }
    length + trailer_len(trailer_header, algorithm)
}

fn framed_len(data_len: u64) -> u64 {
    format!("{data_len:x}").len() as u64 + 2 + data_len + 2
}

fn trailer_len(trailer_header: &str, algorithm: ChecksumAlgorithm) -> u64 {
    // "0\r\n" + "<header>:<digest>\r\n" + "\r\n"
    3 + trailer_header.len() as u64 + 1 + algorithm.encoded_len() as u64 + 2 + 2
}

/// A request body that frames its wrapped body as aws-chunked and appends
/// a checksum trailer.
pub struct ChecksumCalculatingBody {
    inner: Arc<dyn RequestBody>,
    algorithm: ChecksumAlgorithm,
    trailer_header: String,
    chunk_size: usize,
    payload_len: u64,
    explicit_length: bool,
}

impl ChecksumCalculatingBody {
    /// Wrap `inner`, whose length must be known up front.
    pub fn new(
        inner: Arc<dyn RequestBody>,
        algorithm: ChecksumAlgorithm,
        chunk_size: usize,
    ) -> StreamResult<Self> {
        if chunk_size == 0 {
            return Err(StreamError::IllegalArgument(
                "chunk_size must be greater than zero".into(),
            ));
        }
        let Some(payload_len) = inner.content_length() else {
            return Err(StreamError::IllegalArgument(
                "aws-chunked encoding requires a body with a known content length".into(),
            ));
        };
        Ok(Self {
            inner,
            algorithm,
            trailer_header: algorithm.header_name().to_string(),
            chunk_size,
            payload_len,
            explicit_length: false,
        })
    }

    pub fn from_config(inner: Arc<dyn RequestBody>, config: &ChecksumConfig) -> StreamResult<Self> {
        Self::new(inner, config.algorithm, config.chunk_size)
    }

    /// Frame exactly `length` payload bytes regardless of what the wrapped
    /// body declares. Anything the body produces past `length` is dropped.
    pub fn with_content_length(mut self, length: u64) -> Self {
        self.payload_len = length;
        self.explicit_length = true;
        self
    }

    /// Override the trailer header name.
    pub fn with_trailer_header(mut self, header: impl Into<String>) -> Self {
        self.trailer_header = header.into();
        self
    }

    pub fn trailer_header(&self) -> &str {
        &self.trailer_header
    }

    /// Length of the unframed payload.
    pub fn decoded_content_length(&self) -> u64 {
        self.payload_len
    }
}

impl Publisher<Bytes> for ChecksumCalculatingBody {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let algorithm = self.algorithm;
        let chunk_size = self.chunk_size;
        let payload_len = self.payload_len;
        let drop_surplus = self.explicit_length;
        let trailer_header = self.trailer_header.clone();
        let upstream: Arc<dyn Publisher<Bytes>> = Arc::new(self.inner.clone());
        let framed = StagePublisher::new(upstream, move || {
            FramingStage {
                buffer: ChunkBuffer::new(chunk_size, Some(payload_len)),
                checksum: new_checksum(algorithm),
                trailer_header: trailer_header.clone(),
                trailer_sent: false,
                drop_surplus,
            }
        });
        framed.subscribe(subscriber);
    }
}

impl RequestBody for ChecksumCalculatingBody {
    fn content_length(&self) -> Option<u64> {
        Some(chunked_content_length(
            self.payload_len,
            self.chunk_size,
            &self.trailer_header,
            self.algorithm,
        ))
    }

    fn content_type(&self) -> &str {
        self.inner.content_type()
    }
}

struct FramingStage {
    buffer: ChunkBuffer,
    checksum: Box<dyn Checksum>,
    trailer_header: String,
    trailer_sent: bool,
    drop_surplus: bool,
}

impl FramingStage {
    fn frame(&mut self, chunk: &[u8], out: &mut BytesMut) {
        if chunk.is_empty() {
            return;
        }
        self.checksum.update(chunk);
        out.put_slice(format!("{:x}", chunk.len()).as_bytes());
        out.put_slice(CRLF);
        out.put_slice(chunk);
        out.put_slice(CRLF);
    }

    fn trailer(&mut self, out: &mut BytesMut) {
        self.trailer_sent = true;
        let digest = self.checksum.encoded_digest();
        trace!(header = %self.trailer_header, digest = %digest, "appending checksum trailer");
        out.put_slice(b"0\r\n");
        out.put_slice(self.trailer_header.as_bytes());
        out.put_u8(b':');
        out.put_slice(digest.as_bytes());
        out.put_slice(CRLF);
        out.put_slice(CRLF);
    }
}

impl Stage<Bytes, Bytes> for FramingStage {
    fn on_item(&mut self, item: Bytes) -> StreamResult<Vec<Bytes>> {
        let chunks = self.buffer.split(item);
        let surplus = self.buffer.surplus();
        if surplus > 0 {
            if !self.drop_surplus {
                return Err(StreamError::DataIntegrity(format!(
                    "body produced {surplus} bytes more than its declared content length"
                )));
            }
            trace!(surplus, "dropping bytes past the explicit content length");
        }
        let count = chunks.len();
        let mut framed = Vec::with_capacity(count);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut out = BytesMut::with_capacity(chunk.len() + 16);
            self.frame(&chunk, &mut out);
            if i + 1 == count && self.buffer.is_final_emitted() {
                self.trailer(&mut out);
            }
            if !out.is_empty() {
                framed.push(out.freeze());
            }
        }
        Ok(framed)
    }

    fn on_end(&mut self) -> StreamResult<Vec<Bytes>> {
        if self.trailer_sent {
            return Ok(Vec::new());
        }
        if self.buffer.remaining().is_some_and(|r| r > 0) {
            return Err(StreamError::DataIntegrity(format!(
                "body ended {} bytes short of its declared content length",
                self.buffer.remaining().unwrap_or_default()
            )));
        }
        // Zero-length body: the source never produced a chunk.
        let mut out = BytesMut::new();
        self.trailer(&mut out);
        Ok(vec![out.freeze()])
    }
}
