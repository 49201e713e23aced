//! Single-result futures resolved from callback-driven code.
//!
//! A [`Completer`] is the write side and may be shared across threads; only
//! the first `complete`/`fail` wins. The [`Completion`] read side is a
//! `Future` and can also be waited on synchronously.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{StreamError, StreamResult};
use crate::sync::lock;

pub struct Completer<T> {
    tx: Mutex<Option<oneshot::Sender<StreamResult<T>>>>,
}

pub struct Completion<T> {
    rx: oneshot::Receiver<StreamResult<T>>,
}

/// Create a connected completer/completion pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Completer {
            tx: Mutex::new(Some(tx)),
        },
        Completion { rx },
    )
}

impl<T> Completer<T> {
    /// Resolve with `result`. Returns `false` if already resolved.
    pub fn finish(&self, result: StreamResult<T>) -> bool {
        match lock(&self.tx).take() {
            // A dropped receiver is not an error: nobody is waiting.
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    pub fn fail(&self, error: StreamError) -> bool {
        self.finish(Err(error))
    }

    pub fn is_done(&self) -> bool {
        lock(&self.tx).is_none()
    }
}

impl<T> Completion<T> {
    /// A completion that is already resolved.
    pub fn ready(result: StreamResult<T>) -> Self {
        let (completer, completion) = completion();
        completer.finish(result);
        completion
    }

    /// Block the current thread until resolved. Must not be called from
    /// within an async runtime worker.
    pub fn blocking_wait(self) -> StreamResult<T> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Non-blocking check. `None` while still pending.
    pub fn try_result(&mut self) -> Option<StreamResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(dropped())),
        }
    }
}

impl<T> Future for Completion<T> {
    type Output = StreamResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn dropped() -> StreamError {
    StreamError::Cancelled("completion dropped before it was resolved".into())
}
