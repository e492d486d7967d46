//! Mapper worker pool and the fan-in barrier that closes its output.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use crate::cancel::Canceller;
use crate::error::{MapReduceError, Stage};
use crate::recorder::RunStats;
use crate::writer::Writer;

/// Type alias for the shared mapper callback.
pub(crate) type MapFn<S, M> =
    Arc<dyn Fn(S, Writer<M>, Canceller) -> BoxFuture<'static, ()> + Send + Sync>;

/// Shared counters for one run.
#[derive(Clone, Default)]
pub(crate) struct Counters {
    pub generated: Arc<AtomicU64>,
    pub mapped: Arc<AtomicU64>,
    pub emitted: Arc<AtomicU64>,
}

impl Counters {
    pub fn snapshot(&self, workers_started: usize, workers_finished: usize) -> RunStats {
        RunStats {
            generated: self.generated.load(Ordering::Relaxed),
            mapped: self.mapped.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            workers_started,
            workers_finished,
        }
    }
}

/// Run a callback future, converting a panic into a cancellation of the run.
///
/// Returns false if the callback panicked.
pub(crate) async fn guarded<F>(canceller: &Canceller, callback: F) -> bool
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(()) => true,
        Err(payload) => {
            let message = panic_message(&*payload);
            warn!(stage = %canceller.stage(), panic = %message, "Callback panicked");
            canceller.fail(MapReduceError::Panicked {
                stage: canceller.stage(),
                message,
            });
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Spawns the mapper workers.
pub(crate) struct WorkerPool;

impl WorkerPool {
    /// Spawn `workers` tasks sharing `source`, all writing into `output`.
    ///
    /// The returned [`FanIn`] owns the only strong sender of `output`.
    pub fn spawn<S, M>(
        workers: usize,
        source: mpsc::Receiver<S>,
        mapper: MapFn<S, M>,
        output: mpsc::Sender<M>,
        canceller: &Canceller,
        counters: &Counters,
    ) -> FanIn<M>
    where
        S: Send + 'static,
        M: Send + 'static,
    {
        let source = Arc::new(Mutex::new(source));
        let canceller = canceller.for_stage(Stage::Mapper);
        let mut set = JoinSet::new();

        for id in 0..workers {
            let worker = Worker {
                id,
                source: source.clone(),
                mapper: mapper.clone(),
                writer: Writer::new(&output, canceller.token(), counters.emitted.clone()),
                canceller: canceller.clone(),
                mapped: counters.mapped.clone(),
            };
            set.spawn(worker.run().in_current_span());
        }

        FanIn {
            workers: set,
            started: workers,
            output,
        }
    }
}

struct Worker<S, M> {
    id: usize,
    source: Arc<Mutex<mpsc::Receiver<S>>>,
    mapper: MapFn<S, M>,
    writer: Writer<M>,
    canceller: Canceller,
    mapped: Arc<AtomicU64>,
}

impl<S: Send + 'static, M: Send + 'static> Worker<S, M> {
    async fn run(self) {
        debug!(worker = self.id, "Mapper worker started");

        loop {
            let item = {
                let mut source = tokio::select! {
                    biased;
                    _ = self.canceller.cancelled() => break,
                    source = self.source.lock() => source,
                };
                tokio::select! {
                    biased;
                    _ = self.canceller.cancelled() => break,
                    item = source.recv() => item,
                }
            };
            let Some(item) = item else {
                break;
            };

            let writer = self.writer.clone();
            let canceller = self.canceller.clone();
            let mapper = self.mapper.clone();
            if !guarded(&self.canceller, async move { mapper(item, writer, canceller).await }).await {
                break;
            }
            self.mapped.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            worker = self.id,
            cancelled = self.canceller.is_cancelled(),
            "Mapper worker exiting"
        );
    }
}

/// Barrier over the mapper workers.
///
/// Closes the intermediate queue once every worker has been joined.
pub(crate) struct FanIn<M> {
    workers: JoinSet<()>,
    started: usize,
    output: mpsc::Sender<M>,
}

impl<M> FanIn<M> {
    /// Number of workers spawned.
    pub fn started(&self) -> usize {
        self.started
    }

    /// Join every worker, then close the intermediate queue.
    ///
    /// Returns the number of workers joined.
    pub async fn wait(mut self, canceller: &Canceller) -> usize {
        let mut finished = 0;
        while let Some(joined) = self.workers.join_next().await {
            finished += 1;
            if let Err(e) = joined {
                canceller.fail(MapReduceError::Join {
                    stage: Stage::Mapper,
                    source: e,
                });
            }
        }
        debug!(
            workers = finished,
            "All mapper workers finished, closing intermediate queue"
        );
        drop(self.output);
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn doubling() -> MapFn<u64, u64> {
        Arc::new(|item: u64, writer: Writer<u64>, _cancel: Canceller| {
            async move {
                let _ = writer.write(item * 2).await;
            }
            .boxed()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fan_in_closes_after_all_workers() {
        let canceller = Canceller::new(CancellationToken::new());
        let counters = Counters::default();
        let (source_tx, source_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);

        let fan_in = WorkerPool::spawn(3, source_rx, doubling(), out_tx, &canceller, &counters);
        assert_eq!(fan_in.started(), 3);
        let joined = {
            let canceller = canceller.clone();
            tokio::spawn(async move { fan_in.wait(&canceller).await })
        };

        tokio::spawn(async move {
            for i in 1..=10u64 {
                source_tx.send(i).await.unwrap();
            }
        });

        let mut total = 0;
        while let Some(v) = out_rx.recv().await {
            total += v;
        }

        assert_eq!(total, 110);
        assert_eq!(joined.await.unwrap(), 3);
        let stats = counters.snapshot(3, 3);
        assert_eq!(stats.mapped, 10);
        assert_eq!(stats.emitted, 10);
    }

    #[tokio::test]
    async fn test_panicking_mapper_still_releases_barrier() {
        let canceller = Canceller::new(CancellationToken::new());
        let counters = Counters::default();
        let (source_tx, source_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel::<u64>(4);

        let mapper: MapFn<u64, u64> = Arc::new(|item: u64, _writer: Writer<u64>, _cancel: Canceller| {
            async move {
                if item == 2 {
                    panic!("bad item {}", item);
                }
            }
            .boxed()
        });

        let fan_in = WorkerPool::spawn(2, source_rx, mapper, out_tx, &canceller, &counters);
        for i in 1..=3u64 {
            source_tx.send(i).await.unwrap();
        }
        drop(source_tx);

        assert_eq!(fan_in.wait(&canceller).await, 2);
        assert_eq!(out_rx.recv().await, None);

        match canceller.take_error() {
            Some(MapReduceError::Panicked { stage, message }) => {
                assert_eq!(stage, Stage::Mapper);
                assert_eq!(message, "bad item 2");
            }
            other => panic!("expected mapper panic, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_message_from_str() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
    }
}
