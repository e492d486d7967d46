//! Map-reduce builder and executor.

use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cancel::Canceller;
use crate::error::{MapReduceError, Stage};
use crate::options::Options;
use crate::recorder::{NoopRecorder, Recorder, RunStatus};
use crate::source::Source;
use crate::worker::{guarded, Counters, MapFn, WorkerPool};
use crate::writer::{ResultWriter, Writer};

/// Type alias for the generator callback.
type GenerateFn<S> = Box<dyn FnOnce(Writer<S>) -> BoxFuture<'static, ()> + Send>;

/// Type alias for the reducer callback.
type ReduceFn<M, R> =
    Box<dyn FnOnce(Source<M>, ResultWriter<R>, Canceller) -> BoxFuture<'static, ()> + Send>;

/// A map-reduce definition over source items `S`, intermediate values `M`
/// and a result `R`.
///
/// ```rust,no_run
/// use mrflow::MapReduce;
///
/// # async fn example() -> Result<(), mrflow::MapReduceError> {
/// let sum = MapReduce::<u64, u64, u64>::new()
///     .generate(|writer| async move {
///         for i in 0..=100 {
///             if writer.write(i).await.is_err() {
///                 break;
///             }
///         }
///     })
///     .mapper(|item, writer, _cancel| async move {
///         let _ = writer.write(item).await;
///     })
///     .reducer(|mut source, writer, _cancel| async move {
///         let mut total = 0;
///         while let Some(v) = source.next().await {
///             total += v;
///         }
///         writer.write(total);
///     })
///     .with_workers(8)
///     .run()
///     .await?;
/// assert_eq!(sum, 5050);
/// # Ok(())
/// # }
/// ```
pub struct MapReduce<S, M, R> {
    name: &'static str,
    generator: Option<GenerateFn<S>>,
    mapper: Option<MapFn<S, M>>,
    reducer: Option<ReduceFn<M, R>>,
    options: Options,
    recorder: Arc<dyn Recorder>,
    cancellation: Option<CancellationToken>,
}

impl<S, M, R> Default for MapReduce<S, M, R>
where
    S: Send + 'static,
    M: Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, M, R> MapReduce<S, M, R>
where
    S: Send + 'static,
    M: Send + 'static,
    R: Send + 'static,
{
    /// Create an empty definition.
    ///
    /// The worker count starts at zero, so [`with_workers`](Self::with_workers)
    /// must be called before [`run`](Self::run).
    pub fn new() -> Self {
        Self {
            name: "mapreduce",
            generator: None,
            mapper: None,
            reducer: None,
            options: Options::default(),
            recorder: Arc::new(NoopRecorder),
            cancellation: None,
        }
    }

    /// Set the generator that writes the source items.
    ///
    /// The source queue closes when the returned future completes.
    pub fn generate<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Writer<S>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.generator = Some(Box::new(move |writer: Writer<S>| f(writer).boxed()));
        self
    }

    /// Set the mapper called once per source item.
    ///
    /// The mapper may write any number of intermediate values and may cancel
    /// the run with an error.
    pub fn mapper<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(S, Writer<M>, Canceller) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.mapper = Some(Arc::new(move |item: S, writer: Writer<M>, cancel: Canceller| {
            f(item, writer, cancel).boxed()
        }));
        self
    }

    /// Set the reducer that drains the intermediate values and writes the result.
    pub fn reducer<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Source<M>, ResultWriter<R>, Canceller) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.reducer = Some(Box::new(
            move |source: Source<M>, writer: ResultWriter<R>, cancel: Canceller| {
                f(source, writer, cancel).boxed()
            },
        ));
        self
    }

    /// Set the number of mapper workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.options.workers = workers;
        self
    }

    /// Set the name used in logs and by the recorder.
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Replace all sizing options at once.
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Set the capacity of the queue feeding the mappers.
    pub fn with_source_capacity(mut self, capacity: usize) -> Self {
        self.options.source_capacity = capacity;
        self
    }

    /// Set the capacity of the queue feeding the reducer.
    pub fn with_intermediate_capacity(mut self, capacity: usize) -> Self {
        self.options.intermediate_capacity = capacity;
        self
    }

    /// Set the recorder.
    pub fn with_recorder<Rec: Recorder + 'static>(mut self, recorder: Rec) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    /// Abort the run when `token` is cancelled.
    ///
    /// The run observes a child of `token`; cancelling the run itself never
    /// cancels the caller's token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Get the configured options.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Execute the definition and wait for every task to finish.
    ///
    /// Returns the reducer's first written value, or the first recorded error
    /// if anything cancelled the run. Invalid definitions fail before any
    /// task is spawned.
    pub async fn run(self) -> Result<R, MapReduceError> {
        let MapReduce {
            name,
            generator,
            mapper,
            reducer,
            options,
            recorder,
            cancellation,
        } = self;

        let generator = generator.ok_or(MapReduceError::MissingGenerator)?;
        let mapper = mapper.ok_or(MapReduceError::MissingMapper)?;
        let reducer = reducer.ok_or(MapReduceError::MissingReducer)?;
        options.validate()?;

        let run_id = recorder
            .start_run(name, options.workers)
            .await
            .map_err(MapReduceError::Recorder)?;

        let span = info_span!("mapreduce", pipeline = name, run_id = run_id.0);
        info!(
            parent: &span,
            workers = options.workers,
            source_capacity = options.source_capacity,
            intermediate_capacity = options.intermediate_capacity,
            "Starting map-reduce run"
        );

        let token = match &cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        // Stops every spawned task if this future is dropped before it finishes.
        let _shutdown = token.clone().drop_guard();
        let canceller = Canceller::new(token.clone());
        let counters = Counters::default();

        let (source_tx, source_rx) = mpsc::channel(options.source_capacity);
        let (intermediate_tx, intermediate_rx) = mpsc::channel(options.intermediate_capacity);
        let output = ResultWriter::new();

        let generator_handle = tokio::spawn(
            generator_task(
                generator,
                source_tx,
                canceller.for_stage(Stage::Generator),
                counters.generated.clone(),
            )
            .instrument(span.clone()),
        );

        let fan_in = {
            let _entered = span.enter();
            WorkerPool::spawn(
                options.workers,
                source_rx,
                mapper,
                intermediate_tx,
                &canceller,
                &counters,
            )
        };
        let workers_started = fan_in.started();
        let fan_in_handle = {
            let canceller = canceller.clone();
            tokio::spawn(async move { fan_in.wait(&canceller).await }.instrument(span.clone()))
        };

        let reducer_handle = tokio::spawn(
            reducer_task(
                reducer,
                Source::new(intermediate_rx, token),
                output.clone(),
                canceller.for_stage(Stage::Reducer),
            )
            .instrument(span.clone()),
        );

        let reducer_saw_cancel = match reducer_handle.await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                canceller.fail(MapReduceError::Join {
                    stage: Stage::Reducer,
                    source: e,
                });
                true
            }
        };
        // A caller cancelling after the reducer returned does not abort the run.
        if reducer_saw_cancel && cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
        {
            canceller.fail(MapReduceError::Aborted);
        }

        // The outcome is fixed once the reducer returns.
        let failure = canceller.take_error();

        canceller.shutdown();
        if let Err(e) = generator_handle.await {
            canceller.fail(MapReduceError::Join {
                stage: Stage::Generator,
                source: e,
            });
        }
        let workers_finished = match fan_in_handle.await {
            Ok(finished) => finished,
            Err(e) => {
                canceller.fail(MapReduceError::Join {
                    stage: Stage::Mapper,
                    source: e,
                });
                0
            }
        };
        if let Some(late) = canceller.take_error() {
            debug!(parent: &span, error = %late, "Ignoring error raised after the reducer returned");
        }

        let stats = counters.snapshot(workers_started, workers_finished);
        let result = match failure {
            Some(e) => Err(e),
            None => output.take().ok_or(MapReduceError::NoResult),
        };

        let status = match &result {
            Ok(_) => {
                info!(
                    parent: &span,
                    generated = stats.generated,
                    mapped = stats.mapped,
                    emitted = stats.emitted,
                    "Map-reduce run completed"
                );
                RunStatus::Completed
            }
            Err(e) => {
                warn!(
                    parent: &span,
                    error = %e,
                    generated = stats.generated,
                    mapped = stats.mapped,
                    "Map-reduce run cancelled"
                );
                RunStatus::Cancelled {
                    error: e.to_string(),
                }
            }
        };

        recorder
            .complete_run(run_id, status, stats)
            .await
            .map_err(MapReduceError::Recorder)?;

        result
    }
}

async fn generator_task<S: Send + 'static>(
    generate: GenerateFn<S>,
    tx: mpsc::Sender<S>,
    canceller: Canceller,
    generated: Arc<AtomicU64>,
) {
    let writer = Writer::new(&tx, canceller.token(), generated);
    guarded(&canceller, async move { generate(writer).await }).await;
    debug!(
        cancelled = canceller.is_cancelled(),
        "Generator finished, closing source queue"
    );
    drop(tx);
}

/// Returns whether the run was cancelled when the reducer returned.
async fn reducer_task<M: Send + 'static, R: Send + 'static>(
    reduce: ReduceFn<M, R>,
    source: Source<M>,
    output: ResultWriter<R>,
    canceller: Canceller,
) -> bool {
    let cancel = canceller.clone();
    guarded(&canceller, async move { reduce(source, output, cancel).await }).await;
    let cancelled = canceller.is_cancelled();
    debug!(cancelled, "Reducer finished");
    cancelled
}

/// Run a generator and a mapper pool with no result.
///
/// The mapper may cancel the run the same way a map-reduce mapper can.
pub async fn for_each<S, G, GFut, F, FFut>(
    workers: usize,
    generate: G,
    mapper: F,
) -> Result<(), MapReduceError>
where
    S: Send + 'static,
    G: FnOnce(Writer<S>) -> GFut + Send + 'static,
    GFut: Future<Output = ()> + Send + 'static,
    F: Fn(S, Canceller) -> FFut + Send + Sync + 'static,
    FFut: Future<Output = ()> + Send + 'static,
{
    MapReduce::<S, (), ()>::new()
        .with_name("for_each")
        .generate(generate)
        .mapper(move |item, _writer, cancel| mapper(item, cancel))
        .reducer(|mut source, writer, _cancel| async move {
            while source.next().await.is_some() {}
            writer.write(());
        })
        .with_workers(workers)
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summing(k: u64, workers: usize) -> MapReduce<u64, u64, u64> {
        MapReduce::new()
            .generate(move |writer| async move {
                for i in 0..=k {
                    if writer.write(i).await.is_err() {
                        break;
                    }
                }
            })
            .mapper(|item, writer, _cancel| async move {
                let _ = writer.write(item).await;
            })
            .reducer(|mut source, writer, _cancel| async move {
                let mut total = 0;
                while let Some(v) = source.next().await {
                    total += v;
                }
                writer.write(total);
            })
            .with_workers(workers)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sum_of_range() {
        assert_eq!(summing(100, 8).run().await.unwrap(), 5050);
    }

    #[tokio::test]
    async fn test_missing_callbacks_rejected() {
        let err = MapReduce::<u64, u64, u64>::new()
            .with_workers(1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MapReduceError::MissingGenerator));

        let err = MapReduce::<u64, u64, u64>::new()
            .generate(|_writer| async {})
            .reducer(|_source, _writer, _cancel| async {})
            .with_workers(1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MapReduceError::MissingMapper));

        let err = MapReduce::<u64, u64, u64>::new()
            .generate(|_writer| async {})
            .mapper(|_item, _writer, _cancel| async {})
            .with_workers(1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MapReduceError::MissingReducer));
    }

    #[tokio::test]
    async fn test_zero_workers_rejected() {
        let err = summing(10, 0).run().await.unwrap_err();
        assert!(matches!(err, MapReduceError::InvalidWorkers(0)));
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_reducer_without_result() {
        let err = summing(3, 2)
            .reducer(|mut source, _writer, _cancel| async move {
                while source.next().await.is_some() {}
            })
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, MapReduceError::NoResult));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_for_each_visits_every_item() {
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();

        for_each(
            3,
            |writer: Writer<u64>| async move {
                for i in 0..20u64 {
                    let _ = writer.write(i).await;
                }
            },
            move |_item, _cancel| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_for_each_mapper_cancel_returns_error() {
        let err = for_each(
            2,
            |writer: Writer<u64>| async move {
                for i in 0..20u64 {
                    if writer.write(i).await.is_err() {
                        break;
                    }
                }
            },
            |item, cancel| async move {
                if item == 4 {
                    cancel.cancel(anyhow::anyhow!("item {} refused", item));
                }
            },
        )
        .await
        .unwrap_err();

        match err {
            MapReduceError::Callback { stage, source } => {
                assert_eq!(stage, Stage::Mapper);
                assert_eq!(source.to_string(), "item 4 refused");
            }
            other => panic!("expected mapper callback error, got {:?}", other),
        }
    }
}
