//! Ready-made response transformers: buffer into memory, or write to a file.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;
use warpstream_core::sync::lock;
use warpstream_core::{
    completion, Completer, Completion, DownloadConfig, HeaderMap, Publisher, ResponseTransformer,
    StreamError,
};

use crate::sequential::collector;
use crate::sink::{FileSink, FileSinkOptions};

/// A response together with its fully buffered body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBytes<R> {
    pub response: R,
    pub bytes: Bytes,
}

struct Attempt<R, O> {
    completer: Arc<Completer<O>>,
    response: Option<R>,
}

impl<R, O> Attempt<R, O> {
    fn new() -> (Self, Completion<O>) {
        let (completer, completion) = completion();
        (
            Self {
                completer: Arc::new(completer),
                response: None,
            },
            completion,
        )
    }
}

/// Collects the whole body into memory.
pub struct BytesTransformer<R> {
    attempt: Mutex<Option<Attempt<R, ResponseBytes<R>>>>,
}

impl<R> Default for BytesTransformer<R> {
    fn default() -> Self {
        Self {
            attempt: Mutex::new(None),
        }
    }
}

impl<R> BytesTransformer<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Send + 'static> ResponseTransformer<R, ResponseBytes<R>> for BytesTransformer<R> {
    fn prepare(&self) -> Completion<ResponseBytes<R>> {
        let (attempt, completion) = Attempt::new();
        *lock(&self.attempt) = Some(attempt);
        completion
    }

    fn on_response(&self, response: R) {
        if let Some(attempt) = lock(&self.attempt).as_mut() {
            attempt.response = Some(response);
        }
    }

    fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>) {
        let taken = lock(&self.attempt)
            .as_mut()
            .map(|attempt| (attempt.completer.clone(), attempt.response.take()));
        let Some((completer, response)) = taken else {
            return;
        };
        let Some(response) = response else {
            completer.fail(StreamError::ProtocolViolation(
                "body stream arrived before the response".into(),
            ));
            return;
        };
        stream.subscribe(collector(Box::new(move |result| {
            completer.finish(result.map(|bytes| ResponseBytes { response, bytes }));
        })));
    }

    fn exception_occurred(&self, error: StreamError) {
        let completer = lock(&self.attempt).as_ref().map(|a| a.completer.clone());
        if let Some(completer) = completer {
            completer.fail(error);
        }
    }
}

/// Streams the body into a file and resolves to the response headers.
///
/// In ranged mode the write offset is taken from each response's
/// `Content-Range` header, so several part responses can fill one file.
pub struct FileTransformer {
    path: PathBuf,
    ranged: bool,
    delete_partial_on_failure: bool,
    attempt: Mutex<Option<Attempt<HeaderMap, HeaderMap>>>,
}

impl FileTransformer {
    /// Create or truncate `path` and write the body from the start.
    pub fn new(path: impl Into<PathBuf>, config: &DownloadConfig) -> Self {
        Self {
            path: path.into(),
            ranged: false,
            delete_partial_on_failure: config.delete_partial_on_failure,
            attempt: Mutex::new(None),
        }
    }

    /// Write each response at the offset named by its `Content-Range`.
    pub fn ranged(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ranged: true,
            delete_partial_on_failure: false,
            attempt: Mutex::new(None),
        }
    }

    fn sink_options(&self, headers: &HeaderMap) -> Result<FileSinkOptions, StreamError> {
        if !self.ranged {
            return Ok(FileSinkOptions {
                position: None,
                delete_on_failure: self.delete_partial_on_failure,
            });
        }
        match headers.content_range() {
            Some(range) => Ok(FileSinkOptions::at(range?.start)),
            None => Err(StreamError::Client(
                "ranged download response is missing a Content-Range header".into(),
            )),
        }
    }
}

impl ResponseTransformer<HeaderMap, HeaderMap> for FileTransformer {
    fn prepare(&self) -> Completion<HeaderMap> {
        let (attempt, completion) = Attempt::new();
        *lock(&self.attempt) = Some(attempt);
        completion
    }

    fn on_response(&self, response: HeaderMap) {
        if let Some(attempt) = lock(&self.attempt).as_mut() {
            attempt.response = Some(response);
        }
    }

    fn on_stream(&self, stream: Arc<dyn Publisher<Bytes>>) {
        let taken = lock(&self.attempt)
            .as_mut()
            .map(|attempt| (attempt.completer.clone(), attempt.response.take()));
        let Some((completer, headers)) = taken else {
            return;
        };
        let headers = headers.unwrap_or_default();

        let sink = self.sink_options(&headers).and_then(|options| {
            debug!(path = %self.path.display(), position = ?options.position, "streaming response to file");
            let completer = completer.clone();
            FileSink::with_callback(
                &self.path,
                options,
                Box::new(move |result| {
                    completer.finish(result.map(|_| headers));
                }),
            )
        });
        match sink {
            Ok(sink) => stream.subscribe(sink),
            Err(error) => {
                completer.fail(error);
            }
        }
    }

    fn exception_occurred(&self, error: StreamError) {
        let completer = lock(&self.attempt).as_ref().map(|a| a.completer.clone());
        if let Some(completer) = completer {
            completer.fail(error);
        }
    }
}
