//! Checksum validation of a response stream.

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;
use warpstream_core::{
    ChecksumAlgorithm, Publisher, Stage, StagePublisher, StreamError, StreamResult, Subscriber,
};

use crate::checksum::{decode_digest, new_checksum, Checksum};

/// Passes chunks through untouched while checksumming them, then fails the
/// stream with a data-integrity error instead of completing if the digest
/// does not match.
pub struct ChecksumValidatingPublisher {
    inner: Arc<dyn Publisher<Bytes>>,
    algorithm: ChecksumAlgorithm,
    expected: Vec<u8>,
}

impl ChecksumValidatingPublisher {
    pub fn new(
        inner: Arc<dyn Publisher<Bytes>>,
        algorithm: ChecksumAlgorithm,
        expected: Vec<u8>,
    ) -> Self {
        Self {
            inner,
            algorithm,
            expected,
        }
    }

    /// Expect the base64 digest as carried in a checksum header.
    pub fn from_encoded(
        inner: Arc<dyn Publisher<Bytes>>,
        algorithm: ChecksumAlgorithm,
        encoded: &str,
    ) -> StreamResult<Self> {
        let expected = decode_digest(encoded).ok_or_else(|| {
            StreamError::Client(format!("{} is not a valid base64 {algorithm} digest", encoded))
        })?;
        Ok(Self::new(inner, algorithm, expected))
    }
}

impl Publisher<Bytes> for ChecksumValidatingPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let algorithm = self.algorithm;
        let expected = self.expected.clone();
        let validated = StagePublisher::new(self.inner.clone(), move || ValidatingStage {
            checksum: new_checksum(algorithm),
            expected: expected.clone(),
        });
        validated.subscribe(subscriber);
    }
}

struct ValidatingStage {
    checksum: Box<dyn Checksum>,
    expected: Vec<u8>,
}

impl Stage<Bytes, Bytes> for ValidatingStage {
    fn on_item(&mut self, item: Bytes) -> StreamResult<Vec<Bytes>> {
        self.checksum.update(&item);
        Ok(vec![item])
    }

    fn on_end(&mut self) -> StreamResult<Vec<Bytes>> {
        let computed = self.checksum.digest();
        if computed != self.expected {
            let (expected, computed) = (hex::encode(&self.expected), hex::encode(&computed));
            warn!(algorithm = %self.checksum.algorithm(), %expected, %computed, "checksum mismatch");
            return Err(StreamError::DataIntegrity(format!(
                "{} checksum mismatch: expected {expected}, computed {computed}",
                self.checksum.algorithm()
            )));
        }
        Ok(Vec::new())
    }
}
