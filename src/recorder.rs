//! Recording interface for map-reduce runs.

use async_trait::async_trait;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub i64);

/// Terminal outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// The reducer wrote a result and nothing cancelled the run.
    Completed,
    /// The run was cancelled or failed.
    Cancelled { error: String },
}

/// Counters collected over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items the generator wrote to the source queue.
    pub generated: u64,
    /// Mapper invocations that returned.
    pub mapped: u64,
    /// Intermediate values written by mappers.
    pub emitted: u64,
    /// Mapper workers spawned.
    pub workers_started: usize,
    /// Mapper workers joined by the fan-in barrier.
    pub workers_finished: usize,
}

/// Records runs for observability.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Record the start of a run.
    async fn start_run(&self, pipeline_name: &str, workers: usize) -> anyhow::Result<RunId>;

    /// Record run completion.
    async fn complete_run(
        &self,
        run_id: RunId,
        status: RunStatus,
        stats: RunStats,
    ) -> anyhow::Result<()>;
}

/// A no-op recorder that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopRecorder;

impl NoopRecorder {
    /// Create a new no-op recorder.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Recorder for NoopRecorder {
    async fn start_run(&self, _pipeline_name: &str, _workers: usize) -> anyhow::Result<RunId> {
        Ok(RunId(0))
    }

    async fn complete_run(
        &self,
        _run_id: RunId,
        _status: RunStatus,
        _stats: RunStats,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
