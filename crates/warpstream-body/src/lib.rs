//! Request body sources, transform stages and response sinks.
//!
//! Sources ([`BytesBody`], [`FileBody`], [`BlockingStreamBody`],
//! [`BufferingReplayableBody`]) implement [`RequestBody`](warpstream_core::RequestBody)
//! and can be subscribed repeatedly unless documented otherwise. Transform
//! stages wrap another body: [`ChecksumCalculatingBody`] frames it as
//! aws-chunked with a checksum trailer, [`ChecksumValidatingPublisher`]
//! verifies a response digest, [`CompressionBody`] compresses per chunk and
//! [`EnvelopeWrappedPublisher`] adds a header and footer.
//!
//! On the response side, [`FileSink`] and [`SequentialSubscriber`] consume a
//! stream one chunk at a time, and [`BytesTransformer`] / [`FileTransformer`]
//! adapt them to the [`ResponseTransformer`](warpstream_core::ResponseTransformer)
//! interface.

mod blocking;
pub mod checksum;
mod chunked;
mod compress;
mod envelope;
mod file;
mod memory;
mod replay;
mod sequential;
mod sink;
mod transform;
mod validate;

pub use blocking::BlockingStreamBody;
pub use checksum::{new_checksum, Checksum};
pub use chunked::{chunked_content_length, ChecksumCalculatingBody};
pub use compress::{CompressionBody, Compressor, GzipCompressor, DEFAULT_COMPRESSION_CHUNK_SIZE};
pub use envelope::EnvelopeWrappedPublisher;
pub use file::{FileBody, FileBodyBuilder};
pub use memory::BytesBody;
pub use replay::BufferingReplayableBody;
pub use sequential::{collect_bytes, ResultCallback, SequentialSubscriber};
pub use sink::{FileSink, FileSinkOptions};
pub use transform::{BytesTransformer, FileTransformer, ResponseBytes};
pub use validate::ChecksumValidatingPublisher;
