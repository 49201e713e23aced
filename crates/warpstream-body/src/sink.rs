//! Writes a byte stream into a file, one chunk at a time.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use bytes::{Buf, Bytes};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};
use warpstream_core::sync::lock;
use warpstream_core::{completion, Completion, StreamError, StreamResult, Subscriber, Subscription};

use crate::sequential::ResultCallback;

#[derive(Debug, Clone, Copy)]
pub struct FileSinkOptions {
    /// Offset of the first written byte. `None` creates or truncates the
    /// file and writes from the start.
    pub position: Option<u64>,
    /// Remove the output if the stream fails. Only honoured when the sink
    /// created the file itself (`position == None`).
    pub delete_on_failure: bool,
}

impl Default for FileSinkOptions {
    fn default() -> Self {
        Self {
            position: None,
            delete_on_failure: true,
        }
    }
}

impl FileSinkOptions {
    pub fn at(position: u64) -> Self {
        Self {
            position: Some(position),
            delete_on_failure: false,
        }
    }
}

#[derive(Default)]
struct SinkState {
    subscription: Option<Arc<dyn Subscription>>,
    /// Parked between writes; taken by the write in flight.
    file: Option<File>,
    opened: bool,
    writing: bool,
    complete_pending: bool,
    finished: bool,
    written: u64,
}

/// A subscriber that writes every chunk to `path` at an increasing offset.
///
/// Exactly one chunk is requested and written at a time. The result is the
/// number of bytes written. On failure the upstream subscription is
/// cancelled and, if configured, the partially written file is removed.
pub struct FileSink {
    this: Weak<Self>,
    path: PathBuf,
    options: FileSinkOptions,
    handle: Handle,
    state: Mutex<SinkState>,
    done: Mutex<Option<ResultCallback<u64>>>,
}

impl FileSink {
    pub fn new(
        path: impl Into<PathBuf>,
        options: FileSinkOptions,
    ) -> StreamResult<(Arc<Self>, Completion<u64>)> {
        let (completer, completion) = completion();
        let sink = Self::with_callback(
            path,
            options,
            Box::new(move |result| {
                completer.finish(result);
            }),
        )?;
        Ok((sink, completion))
    }

    /// Must be called from within a tokio runtime; writes run on it.
    pub fn with_callback(
        path: impl Into<PathBuf>,
        options: FileSinkOptions,
        done: ResultCallback<u64>,
    ) -> StreamResult<Arc<Self>> {
        let handle = Handle::try_current().map_err(|_| {
            StreamError::Client("file sinks must be created within a tokio runtime".into())
        })?;
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            path: path.into(),
            options,
            handle,
            state: Mutex::new(SinkState::default()),
            done: Mutex::new(Some(done)),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn deletes_on_failure(&self) -> bool {
        self.options.delete_on_failure && self.options.position.is_none()
    }

    async fn open_file(&self) -> StreamResult<File> {
        let io = |e: std::io::Error| StreamError::io(&self.path, e);
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        match self.options.position {
            None => options.truncate(true).open(&self.path).await.map_err(io),
            Some(position) => {
                let mut file = options.open(&self.path).await.map_err(io)?;
                file.seek(SeekFrom::Start(position)).await.map_err(io)?;
                Ok(file)
            }
        }
    }

    async fn open(self: Arc<Self>) {
        let mut file = match self.open_file().await {
            Ok(file) => Some(file),
            Err(error) => {
                self.fail(error);
                return;
            }
        };
        trace!(path = %self.path.display(), position = ?self.options.position, "file sink opened");
        let next = {
            let mut state = lock(&self.state);
            if state.finished {
                None
            } else {
                state.opened = true;
                state.file = file.take();
                Some((state.subscription.clone(), state.complete_pending))
            }
        };
        match next {
            None => {
                // Failed while opening; the file was created after cleanup ran.
                drop(file);
                self.discard().await;
            }
            Some((_, true)) => self.close(Ok(())).await,
            Some((Some(subscription), false)) => subscription.request(1),
            Some((None, false)) => {}
        }
    }

    async fn write(self: Arc<Self>, mut file: File, chunk: Bytes) {
        let len = chunk.len() as u64;
        if let Err(error) = write_fully(&mut file, chunk).await {
            {
                let mut state = lock(&self.state);
                state.writing = false;
                state.file = Some(file);
            }
            self.fail(StreamError::io(&self.path, error));
            return;
        }

        let next = {
            let mut state = lock(&self.state);
            state.writing = false;
            state.written += len;
            if state.finished {
                None
            } else {
                state.file = Some(file);
                Some((state.subscription.clone(), state.complete_pending))
            }
        };
        match next {
            Some((_, true)) => self.close(Ok(())).await,
            Some((Some(subscription), false)) => subscription.request(1),
            _ => {}
        }
    }

    /// Cancel upstream and fail the result.
    fn fail(&self, error: StreamError) {
        let subscription = lock(&self.state).subscription.take();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
        self.spawn_close(Err(error));
    }

    fn spawn_close(&self, outcome: StreamResult<()>) {
        if let Some(this) = self.this.upgrade() {
            self.handle.spawn(async move { this.close(outcome).await });
        }
    }

    async fn close(&self, outcome: StreamResult<()>) {
        let (file, written) = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            state.subscription = None;
            (state.file.take(), state.written)
        };

        let result = match (outcome, file) {
            (Ok(()), Some(mut file)) => file
                .flush()
                .await
                .map(|()| written)
                .map_err(|e| StreamError::io(&self.path, e)),
            (Ok(()), None) => Ok(written),
            (Err(error), _) => Err(error),
        };
        if let Err(error) = &result {
            debug!(path = %self.path.display(), error = %error, "file sink failed");
            self.discard().await;
        } else {
            debug!(path = %self.path.display(), written, "file sink complete");
        }

        let done = lock(&self.done).take();
        if let Some(done) = done {
            done(result);
        }
    }

    async fn discard(&self) {
        if !self.deletes_on_failure() {
            return;
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => trace!(path = %self.path.display(), "removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial output"),
        }
    }
}

/// Write all of `chunk`, retrying short writes against what is left.
async fn write_fully(file: &mut File, mut chunk: Bytes) -> std::io::Result<()> {
    while chunk.has_remaining() {
        match file.write(chunk.chunk()).await {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => chunk.advance(n),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl Subscriber<Bytes> for FileSink {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let accepted = {
            let mut state = lock(&self.state);
            if state.subscription.is_some() || state.finished {
                false
            } else {
                state.subscription = Some(subscription.clone());
                true
            }
        };
        if !accepted {
            warn!(path = %self.path.display(), "file sink already subscribed");
            subscription.cancel();
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.handle.spawn(this.open());
        }
    }

    fn on_next(&self, chunk: Bytes) {
        let file = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            let file = state.file.take();
            state.writing = file.is_some();
            file
        };
        match (file, self.this.upgrade()) {
            (Some(file), Some(this)) => {
                self.handle.spawn(this.write(file, chunk));
            }
            _ => self.fail(StreamError::ProtocolViolation(
                "chunk delivered without outstanding demand".into(),
            )),
        }
    }

    fn on_error(&self, error: StreamError) {
        lock(&self.state).subscription = None;
        self.spawn_close(Err(error));
    }

    fn on_complete(&self) {
        let close_now = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            if state.writing || !state.opened {
                state.complete_pending = true;
                false
            } else {
                true
            }
        };
        if close_now {
            self.spawn_close(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BytesBody;
    use warpstream_core::{Publisher, SimplePublisher};

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let body = BytesBody::from_buffers([Bytes::from("hello "), Bytes::from("file "), Bytes::from("sink")]);
        let (sink, done) = FileSink::new(&path, FileSinkOptions::default()).unwrap();
        body.subscribe(sink);

        assert_eq!(done.await.unwrap(), 15);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello file sink");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_stream_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        let (sink, done) = FileSink::new(&path, FileSinkOptions::default()).unwrap();
        BytesBody::empty().subscribe(sink);

        assert_eq!(done.await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_at_offset_without_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranged.bin");
        std::fs::write(&path, b"..........").unwrap();

        let (sink, done) = FileSink::new(&path, FileSinkOptions::at(4)).unwrap();
        BytesBody::from_string("abc").subscribe(sink);

        assert_eq!(done.await.unwrap(), 3);
        assert_eq!(std::fs::read(&path).unwrap(), b"....abc...");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completion_during_write_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deferred.bin");
        let publisher = SimplePublisher::<Bytes>::new();
        let (sink, done) = FileSink::new(&path, FileSinkOptions::default()).unwrap();
        publisher.subscribe(sink);

        for part in ["one,", "two,", "three"] {
            let _ = publisher.send(Bytes::from(part));
        }
        let _ = publisher.complete();

        assert_eq!(done.await.unwrap(), 13);
        assert_eq!(std::fs::read(&path).unwrap(), b"one,two,three");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upstream_error_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let publisher = SimplePublisher::<Bytes>::new();
        let (sink, done) = FileSink::new(&path, FileSinkOptions::default()).unwrap();
        publisher.subscribe(sink);

        publisher.send(Bytes::from("some bytes")).await.unwrap();
        let _ = publisher.error(StreamError::Client("connection reset".into()));

        assert!(matches!(done.await, Err(StreamError::Client(_))));
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ranged_failure_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let publisher = SimplePublisher::<Bytes>::new();
        let (sink, done) = FileSink::new(&path, FileSinkOptions::at(2)).unwrap();
        publisher.subscribe(sink);

        publisher.send(Bytes::from("ab")).await.unwrap();
        let _ = publisher.error(StreamError::Client("part failed".into()));

        assert!(done.await.is_err());
        assert!(path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_failure_cancels_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("out.bin");
        let publisher = SimplePublisher::<Bytes>::new();
        let (sink, done) = FileSink::new(&path, FileSinkOptions::default()).unwrap();
        publisher.subscribe(sink);

        assert!(matches!(done.await, Err(StreamError::Io { .. })));
        assert!(publisher.is_cancelled());
    }

    #[test]
    fn requires_runtime() {
        let result = FileSink::new("/tmp/never-written", FileSinkOptions::default());
        assert!(matches!(result, Err(StreamError::Client(_))));
    }
}
