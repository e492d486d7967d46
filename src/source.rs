//! The reducer's view of the intermediate queue.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Live stream of intermediate values.
///
/// Ends when every mapper worker has finished, or immediately once the run
/// is cancelled. Values still buffered at cancellation are discarded.
pub struct Source<M> {
    rx: mpsc::Receiver<M>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<M> Source<M> {
    pub(crate) fn new(rx: mpsc::Receiver<M>, token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self {
            rx,
            token,
            cancelled,
        }
    }

    /// Receive the next value, or `None` once the queue is closed or the run is cancelled.
    pub async fn next(&mut self) -> Option<M> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            value = self.rx.recv() => value,
        }
    }

    /// Drain the remaining values into a `Vec`.
    pub async fn collect_vec(mut self) -> Vec<M> {
        let mut values = Vec::new();
        while let Some(value) = self.next().await {
            values.push(value);
        }
        values
    }
}

impl<M> Stream for Source<M> {
    type Item = M;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<M>> {
        if self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}
