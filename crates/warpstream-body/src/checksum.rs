//! Pluggable running checksums.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use warpstream_core::ChecksumAlgorithm;

/// A running checksum over a byte stream.
///
/// `digest` does not consume or reset the running state.
pub trait Checksum: Send {
    fn algorithm(&self) -> ChecksumAlgorithm;
    fn update(&mut self, data: &[u8]);
    fn reset(&mut self);
    fn digest(&self) -> Vec<u8>;

    /// Base64 of the current digest, as carried in trailers and headers.
    fn encoded_digest(&self) -> String {
        encode_digest(&self.digest())
    }
}

pub fn new_checksum(algorithm: ChecksumAlgorithm) -> Box<dyn Checksum> {
    match algorithm {
        ChecksumAlgorithm::Crc32 => Box::new(Crc32Checksum::default()),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Checksum::default()),
        ChecksumAlgorithm::Md5 => Box::new(Md5Checksum::default()),
    }
}

pub fn encode_digest(digest: &[u8]) -> String {
    STANDARD.encode(digest)
}

/// Decode a base64 digest; `None` if it is not valid base64.
pub fn decode_digest(encoded: &str) -> Option<Vec<u8>> {
    STANDARD.decode(encoded.trim()).ok()
}

/// Digest of `data` in one call.
pub fn digest_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut checksum = new_checksum(algorithm);
    checksum.update(data);
    checksum.digest()
}

#[derive(Default, Clone)]
pub struct Crc32Checksum {
    hasher: crc32fast::Hasher,
}

impl Checksum for Crc32Checksum {
    fn algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Crc32
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn reset(&mut self) {
        self.hasher.reset();
    }

    fn digest(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_be_bytes().to_vec()
    }
}

#[derive(Default, Clone)]
pub struct Sha256Checksum {
    hasher: Sha256,
}

impl Checksum for Sha256Checksum {
    fn algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Sha256
    }

    fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    fn reset(&mut self) {
        self.hasher = Sha256::new();
    }

    fn digest(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_vec()
    }
}

#[derive(Clone)]
pub struct Md5Checksum {
    context: md5::Context,
}

impl Default for Md5Checksum {
    fn default() -> Self {
        Self {
            context: md5::Context::new(),
        }
    }
}

impl Checksum for Md5Checksum {
    fn algorithm(&self) -> ChecksumAlgorithm {
        ChecksumAlgorithm::Md5
    }

    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn reset(&mut self) {
        self.context = md5::Context::new();
    }

    fn digest(&self) -> Vec<u8> {
        self.context.clone().compute().0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_matches_known_vector() {
        let mut checksum = new_checksum(ChecksumAlgorithm::Crc32);
        checksum.update(b"Hello ");
        checksum.update(b"world");
        assert_eq!(checksum.encoded_digest(), "i9aeUg==");
        assert_eq!(hex::encode(checksum.digest()), "8bd69e52");
    }

    #[test]
    fn empty_crc32_is_zero() {
        assert_eq!(new_checksum(ChecksumAlgorithm::Crc32).encoded_digest(), "AAAAAA==");
    }

    #[test]
    fn sha256_and_md5_known_vectors() {
        assert_eq!(
            hex::encode(digest_of(ChecksumAlgorithm::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(digest_of(ChecksumAlgorithm::Md5, b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn digest_does_not_disturb_running_state() {
        for algorithm in [
            ChecksumAlgorithm::Crc32,
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Md5,
        ] {
            let mut checksum = new_checksum(algorithm);
            checksum.update(b"part one,");
            let _ = checksum.digest();
            checksum.update(b" part two");
            assert_eq!(checksum.digest(), digest_of(algorithm, b"part one, part two"));
            assert_eq!(checksum.encoded_digest().len(), algorithm.encoded_len());

            checksum.reset();
            assert_eq!(checksum.digest(), digest_of(algorithm, b""));
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(decode_digest("i9aeUg=="), Some(vec![0x8b, 0xd6, 0x9e, 0x52]));
        assert_eq!(decode_digest("not base64!"), None);
    }
}
