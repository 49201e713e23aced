//! warpstream.toml configuration.
//!
//! Every section and field is optional; omitted values fall back to the
//! defaults below.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_FILE_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BLOCKING_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_BLOCKING_RESET_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CHECKSUM_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
pub const DEFAULT_SPLIT_BUFFER_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub body: BodyConfig,
    pub checksum: ChecksumConfig,
    pub split: SplitConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Read size for file-backed bodies.
    pub file_chunk_size: usize,
    /// Read size for bodies over blocking readers.
    pub blocking_chunk_size: usize,
    /// How long a resubscribe waits for the previous reader worker to stop.
    pub blocking_reset_timeout_ms: u64,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
            blocking_chunk_size: DEFAULT_BLOCKING_CHUNK_SIZE,
            blocking_reset_timeout_ms: DEFAULT_BLOCKING_RESET_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Crc32,
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    /// Trailer header carrying the base64 digest.
    pub fn header_name(self) -> &'static str {
        match self {
            Self::Crc32 => "x-amz-checksum-crc32",
            Self::Sha256 => "x-amz-checksum-sha256",
            Self::Md5 => "content-md5",
        }
    }

    /// Raw digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Crc32 => 4,
            Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }

    /// Length of the digest once base64 encoded (with padding).
    pub fn encoded_len(self) -> usize {
        self.digest_len().div_ceil(3) * 4
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Crc32 => "crc32",
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    /// Payload bytes per aws-chunked data chunk.
    pub chunk_size: usize,
    pub algorithm: ChecksumAlgorithm,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHECKSUM_CHUNK_SIZE,
            algorithm: ChecksumAlgorithm::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub part_size: u64,
    /// Ceiling on bytes held in memory across undelivered parts.
    pub buffer_size: u64,
    /// Whether parts buffer their bytes so they can be resubscribed.
    pub retryable: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            buffer_size: DEFAULT_SPLIT_BUFFER_SIZE,
            retryable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Remove a partially written destination file when the download fails.
    pub delete_partial_on_failure: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            delete_partial_on_failure: true,
        }
    }
}

impl StreamConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StreamConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field| Err(ConfigError::Zero { field });
        if self.body.file_chunk_size == 0 {
            return zero("body.file_chunk_size");
        }
        if self.body.blocking_chunk_size == 0 {
            return zero("body.blocking_chunk_size");
        }
        if self.checksum.chunk_size == 0 {
            return zero("checksum.chunk_size");
        }
        self.split.validate()
    }
}

impl SplitConfig {
    /// Unknown-length parts are only published once full, so a ceiling
    /// below one part would stall the split.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.part_size == 0 {
            return Err(ConfigError::Zero { field: "split.part_size" });
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Zero { field: "split.buffer_size" });
        }
        if self.buffer_size < self.part_size {
            return Err(ConfigError::BufferTooSmall {
                buffer_size: self.buffer_size,
                part_size: self.part_size,
            });
        }
        Ok(())
    }
}
