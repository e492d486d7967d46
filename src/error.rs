//! Error types for map-reduce runs.

use std::fmt;

use thiserror::Error;

/// The part of a run an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The generator producing work items.
    Generator,
    /// A mapper worker.
    Mapper,
    /// The reducer.
    Reducer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generator => "generator",
            Self::Mapper => "mapper",
            Self::Reducer => "reducer",
        };
        f.write_str(name)
    }
}

/// Error returned by [`MapReduce::run`](crate::MapReduce::run).
#[derive(Error, Debug)]
pub enum MapReduceError {
    /// No generator was registered.
    #[error("generator is not set")]
    MissingGenerator,

    /// No mapper was registered.
    #[error("mapper is not set")]
    MissingMapper,

    /// No reducer was registered.
    #[error("reducer is not set")]
    MissingReducer,

    /// The worker count is below one.
    #[error("worker count must be at least 1, got {0}")]
    InvalidWorkers(usize),

    /// A queue capacity is below one.
    #[error("{queue} queue capacity must be at least 1, got {capacity}")]
    InvalidCapacity {
        queue: &'static str,
        capacity: usize,
    },

    /// A callback cancelled the run with an error.
    #[error("{stage} cancelled the run: {source}")]
    Callback {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// A callback panicked.
    #[error("{stage} panicked: {message}")]
    Panicked { stage: Stage, message: String },

    /// A task could not be joined.
    #[error("{stage} task failed: {source}")]
    Join {
        stage: Stage,
        #[source]
        source: tokio::task::JoinError,
    },

    /// The caller's cancellation token fired before the run completed.
    #[error("run aborted by caller")]
    Aborted,

    /// The reducer returned without writing a result.
    #[error("reducer returned without writing a result")]
    NoResult,

    /// Recording failed.
    #[error("recorder error: {0}")]
    Recorder(#[source] anyhow::Error),
}

impl MapReduceError {
    /// Returns the stage this error originated from, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Callback { stage, .. } | Self::Panicked { stage, .. } | Self::Join { stage, .. } => {
                Some(*stage)
            }
            Self::NoResult => Some(Stage::Reducer),
            _ => None,
        }
    }

    /// Returns true if the definition was rejected before any task started.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::MissingGenerator
                | Self::MissingMapper
                | Self::MissingReducer
                | Self::InvalidWorkers(_)
                | Self::InvalidCapacity { .. }
        )
    }
}

/// Error returned when a value cannot be written to a queue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,

    /// The queue was closed by its consumer or by the fan-in barrier.
    #[error("queue closed")]
    Closed,
}
