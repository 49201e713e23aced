//! File-backed request bodies with end-of-stream integrity checks.
//!
//! Each subscription opens its own handle on the tokio runtime it was
//! subscribed from and reads strictly sequentially: at most one read is in
//! flight, and the next one is only issued when the subscriber still has
//! outstanding demand. File size and modification time are captured at
//! open and compared again once the range is exhausted, so a file modified
//! underneath an upload fails the subscription instead of sending a body
//! that no longer matches its declared length or checksum.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};
use warpstream_core::config::DEFAULT_FILE_CHUNK_SIZE;
use warpstream_core::reactive::add_demand;
use warpstream_core::sync::lock;
use warpstream_core::{
    reject, BodyConfig, Publisher, RequestBody, StreamError, StreamResult, Subscriber,
    Subscription, DEFAULT_CONTENT_TYPE,
};

/// A body reading `[position, position + limit)` of a file.
///
/// Without a limit the range extends to the end of the file as observed at
/// subscribe time.
#[derive(Debug, Clone)]
pub struct FileBody {
    path: PathBuf,
    position: u64,
    limit: Option<u64>,
    chunk_size: usize,
    content_type: String,
}

#[derive(Debug, Clone)]
pub struct FileBodyBuilder {
    body: FileBody,
}

impl FileBodyBuilder {
    pub fn position(mut self, position: u64) -> Self {
        self.body.position = position;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.body.limit = Some(limit);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.body.chunk_size = chunk_size;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.body.content_type = content_type.into();
        self
    }

    pub fn build(self) -> FileBody {
        assert!(self.body.chunk_size > 0, "chunk_size must be > 0");
        self.body
    }
}

impl FileBody {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::builder(path).build()
    }

    pub fn builder(path: impl Into<PathBuf>) -> FileBodyBuilder {
        FileBodyBuilder {
            body: FileBody {
                path: path.into(),
                position: 0,
                limit: None,
                chunk_size: DEFAULT_FILE_CHUNK_SIZE,
                content_type: DEFAULT_CONTENT_TYPE.to_string(),
            },
        }
    }

    pub fn from_config(path: impl Into<PathBuf>, config: &BodyConfig) -> Self {
        Self::builder(path).chunk_size(config.file_chunk_size).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Cut this body's range into consecutive bodies of at most `part_size`
    /// bytes. Each part re-reads the file, so nothing is buffered. An empty
    /// range yields a single empty part.
    pub fn split(&self, part_size: u64) -> StreamResult<Vec<FileBody>> {
        if part_size == 0 {
            return Err(StreamError::IllegalArgument(
                "part_size must be greater than zero".into(),
            ));
        }
        let total = match self.limit {
            Some(limit) => limit,
            None => {
                let size = std::fs::metadata(&self.path)
                    .map_err(|e| StreamError::io(&self.path, e))?
                    .len();
                size.saturating_sub(self.position)
            }
        };

        let mut parts = Vec::new();
        let mut offset = 0;
        loop {
            let len = part_size.min(total - offset);
            parts.push(FileBody {
                position: self.position + offset,
                limit: Some(len),
                ..self.clone()
            });
            offset += len;
            if offset >= total {
                break;
            }
        }
        debug!(path = %self.path.display(), total, parts = parts.len(), "split file body");
        Ok(parts)
    }
}

impl Publisher<Bytes> for FileBody {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let Ok(handle) = Handle::try_current() else {
            reject(
                subscriber.as_ref(),
                StreamError::Client("file bodies must be subscribed within a tokio runtime".into()),
            );
            return;
        };
        let subscription = FileSubscription::new(self.clone(), subscriber.clone(), handle.clone());
        subscriber.on_subscribe(subscription.clone());
        handle.spawn(subscription.open());
    }
}

impl RequestBody for FileBody {
    fn content_length(&self) -> Option<u64> {
        match self.limit {
            Some(limit) => Some(limit),
            None => std::fs::metadata(&self.path)
                .ok()
                .map(|m| m.len().saturating_sub(self.position)),
        }
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// An open file plus what was observed about it at open time.
struct Reader {
    file: tokio::fs::File,
    size: u64,
    modified: Option<SystemTime>,
    expected: u64,
    remaining: u64,
}

impl Reader {
    async fn open(body: &FileBody) -> StreamResult<Self> {
        let io = |e: std::io::Error| StreamError::io(&body.path, e);
        let mut file = tokio::fs::File::open(&body.path).await.map_err(io)?;
        let metadata = file.metadata().await.map_err(io)?;
        let size = metadata.len();
        let available = size.saturating_sub(body.position);
        let expected = body.limit.unwrap_or(available);
        if expected > available {
            return Err(StreamError::DataIntegrity(format!(
                "{} holds {available} bytes from offset {} but {expected} were requested",
                body.path.display(),
                body.position
            )));
        }
        file.seek(SeekFrom::Start(body.position)).await.map_err(io)?;
        Ok(Self {
            file,
            size,
            modified: metadata.modified().ok(),
            expected,
            remaining: expected,
        })
    }

    async fn read_chunk(&mut self, path: &Path, chunk_size: usize) -> StreamResult<Bytes> {
        let want = (chunk_size as u64).min(self.remaining) as usize;
        let mut buf = BytesMut::zeroed(want);
        let read = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| StreamError::io(path, e))?;
        if read == 0 {
            let got = self.expected - self.remaining;
            warn!(path = %path.display(), got, expected = self.expected, "file ended early");
            return Err(StreamError::DataIntegrity(format!(
                "{} ended after {got} of {} expected bytes",
                path.display(),
                self.expected
            )));
        }
        buf.truncate(read);
        self.remaining -= read as u64;
        Ok(buf.freeze())
    }

    /// Confirm the file still looks the way it did when it was opened.
    async fn verify(self, path: &Path) -> StreamResult<()> {
        drop(self.file);
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| StreamError::io(path, e))?;
        if metadata.len() != self.size {
            warn!(path = %path.display(), before = self.size, after = metadata.len(), "file size changed during read");
            return Err(StreamError::DataIntegrity(format!(
                "size of {} changed from {} to {} bytes while it was being read",
                path.display(),
                self.size,
                metadata.len()
            )));
        }
        if metadata.modified().ok() != self.modified {
            warn!(path = %path.display(), "file modification time changed during read");
            return Err(StreamError::DataIntegrity(format!(
                "{} was modified while it was being read",
                path.display()
            )));
        }
        if self.remaining != 0 {
            return Err(StreamError::DataIntegrity(format!(
                "read {} of {} expected bytes from {}",
                self.expected - self.remaining,
                self.expected,
                path.display()
            )));
        }
        Ok(())
    }
}

struct FileSubscription {
    this: Weak<Self>,
    body: FileBody,
    handle: Handle,
    subscriber: Mutex<Option<Arc<dyn Subscriber<Bytes>>>>,
    reader: Mutex<Option<Reader>>,
    opened: AtomicBool,
    demand: AtomicU64,
    reading: AtomicBool,
    done: AtomicBool,
}

impl FileSubscription {
    fn new(body: FileBody, subscriber: Arc<dyn Subscriber<Bytes>>, handle: Handle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            body,
            handle,
            subscriber: Mutex::new(Some(subscriber)),
            reader: Mutex::new(None),
            opened: AtomicBool::new(false),
            demand: AtomicU64::new(0),
            reading: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }

    async fn open(self: Arc<Self>) {
        let reader = match Reader::open(&self.body).await {
            Ok(reader) => reader,
            Err(error) => {
                self.terminate(Err(error));
                return;
            }
        };
        trace!(path = %self.body.path.display(), expected = reader.expected, "file body opened");
        if reader.remaining == 0 {
            let verdict = reader.verify(&self.body.path).await;
            self.terminate(verdict);
            return;
        }
        *lock(&self.reader) = Some(reader);
        self.opened.store(true, Ordering::Release);
        if self.done.load(Ordering::Acquire) {
            lock(&self.reader).take();
            return;
        }
        self.maybe_read();
    }

    fn should_read(&self) -> bool {
        !self.done.load(Ordering::Acquire)
            && self.opened.load(Ordering::Acquire)
            && self.demand.load(Ordering::Acquire) > 0
    }

    fn maybe_read(&self) {
        loop {
            if !self.should_read() {
                return;
            }
            if self
                .reading
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if self.should_read() {
                if let Some(this) = self.this.upgrade() {
                    self.handle.spawn(this.read_next());
                    return;
                }
            }
            self.reading.store(false, Ordering::Release);
        }
    }

    /// Runs with `reading` held, which also serializes `on_next`.
    async fn read_next(self: Arc<Self>) {
        let Some(mut reader) = lock(&self.reader).take() else {
            self.reading.store(false, Ordering::Release);
            return;
        };
        let chunk = match reader.read_chunk(&self.body.path, self.body.chunk_size).await {
            Ok(chunk) => chunk,
            Err(error) => {
                self.terminate(Err(error));
                return;
            }
        };
        if self.done.load(Ordering::Acquire) {
            return;
        }

        self.demand.fetch_sub(1, Ordering::AcqRel);
        if reader.remaining == 0 {
            self.deliver(chunk);
            let verdict = reader.verify(&self.body.path).await;
            self.terminate(verdict);
            return;
        }

        *lock(&self.reader) = Some(reader);
        self.deliver(chunk);
        self.reading.store(false, Ordering::Release);
        self.maybe_read();
    }

    fn deliver(&self, chunk: Bytes) {
        let subscriber = lock(&self.subscriber).clone();
        if let Some(subscriber) = subscriber {
            subscriber.on_next(chunk);
        }
    }

    fn terminate(&self, result: StreamResult<()>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.reader).take();
        let Some(subscriber) = lock(&self.subscriber).take() else {
            return;
        };
        match result {
            Ok(()) => {
                trace!(path = %self.body.path.display(), "file body complete");
                subscriber.on_complete();
            }
            Err(error) => {
                debug!(path = %self.body.path.display(), error = %error, "file body failed");
                subscriber.on_error(error);
            }
        }
    }
}

impl Subscription for FileSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            self.terminate(Err(StreamError::illegal_demand(n)));
            return;
        }
        let _ = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(add_demand(current, n))
            });
        self.maybe_read();
    }

    fn cancel(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(path = %self.body.path.display(), "file body cancelled");
        lock(&self.subscriber).take();
        lock(&self.reader).take();
    }
}
