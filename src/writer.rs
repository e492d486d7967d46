//! Emission handles given to callbacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::WriteError;

/// Writes values into one of the run's queues.
///
/// A writer never keeps its queue open: the owning task holds the only
/// strong sender, so writes after the queue is closed fail with
/// [`WriteError::Closed`] instead of stalling the consumer.
pub struct Writer<T> {
    tx: mpsc::WeakSender<T>,
    token: CancellationToken,
    written: Arc<AtomicU64>,
}

impl<T> Clone for Writer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
            written: self.written.clone(),
        }
    }
}

impl<T: Send> Writer<T> {
    pub(crate) fn new(
        tx: &mpsc::Sender<T>,
        token: CancellationToken,
        written: Arc<AtomicU64>,
    ) -> Self {
        Self {
            tx: tx.downgrade(),
            token,
            written,
        }
    }

    /// Write one value, waiting while the queue is full.
    ///
    /// Returns [`WriteError::Cancelled`] as soon as the run is cancelled,
    /// including while waiting for capacity.
    pub async fn write(&self, value: T) -> Result<(), WriteError> {
        if self.token.is_cancelled() {
            return Err(WriteError::Cancelled);
        }
        let tx = self.tx.upgrade().ok_or(WriteError::Closed)?;

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(WriteError::Cancelled),
            sent = tx.send(value) => {
                sent.map_err(|_| WriteError::Closed)?;
                self.written.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Returns true once the run is cancelled; further writes will fail.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Write-once slot the reducer stores its result in.
///
/// Only the first write is kept.
pub struct ResultWriter<R> {
    slot: Arc<Mutex<Option<R>>>,
}

impl<R> Clone for ResultWriter<R> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<R> ResultWriter<R> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Store the result. Returns false if a result was already written.
    pub fn write(&self, value: R) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("Reducer wrote more than one result, keeping the first");
            return false;
        }
        *slot = Some(value);
        true
    }

    pub(crate) fn take(&self) -> Option<R> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
