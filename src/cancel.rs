//! Shared cancellation state for a single run.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{MapReduceError, Stage};

struct CancelState {
    token: CancellationToken,
    error: Mutex<Option<MapReduceError>>,
}

/// Handle to the run's cancellation token, handed to mapper and reducer callbacks.
///
/// Every clone observes the same token. The first recorded error wins; later
/// calls still cancel the run but leave the recorded error untouched.
#[derive(Clone)]
pub struct Canceller {
    state: Arc<CancelState>,
    stage: Stage,
}

impl Canceller {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(CancelState {
                token,
                error: Mutex::new(None),
            }),
            stage: Stage::Generator,
        }
    }

    /// A handle sharing this state whose `cancel` calls are attributed to `stage`.
    pub(crate) fn for_stage(&self, stage: Stage) -> Self {
        Self {
            state: self.state.clone(),
            stage,
        }
    }

    /// Cancel the run with an error.
    pub fn cancel(&self, err: impl Into<anyhow::Error>) {
        self.fail(MapReduceError::Callback {
            stage: self.stage,
            source: err.into(),
        });
    }

    /// Returns true once the run has been cancelled for any reason.
    pub fn is_cancelled(&self) -> bool {
        self.state.token.is_cancelled()
    }

    /// Wait until the run is cancelled.
    pub async fn cancelled(&self) {
        self.state.token.cancelled().await
    }

    /// Stage this handle reports errors as.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Record `err` unless an error is already recorded, then cancel.
    ///
    /// Returns true if `err` became the run's error.
    pub(crate) fn fail(&self, err: MapReduceError) -> bool {
        let recorded = {
            let mut slot = self
                .state
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                warn!(stage = %self.stage, error = %err, "Cancelling run");
                *slot = Some(err);
                true
            } else {
                false
            }
        };
        self.state.token.cancel();
        recorded
    }

    /// Cancel without recording an error, used to stop producers once the reducer is done.
    pub(crate) fn shutdown(&self) {
        self.state.token.cancel();
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.state.token.clone()
    }

    pub(crate) fn take_error(&self) -> Option<MapReduceError> {
        self.state
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
