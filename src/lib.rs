//! # mrflow
//!
//! Embeddable concurrent map-reduce.
//!
//! One generator feeds a bounded queue, a fixed pool of mapper workers
//! drains it, and a single reducer folds everything the mappers write into
//! one result. Any mapper or reducer can cancel the run with an error; the
//! first error wins and is what [`MapReduce::run`] returns.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mrflow::MapReduce;
//!
//! let total = MapReduce::<u64, u64, u64>::new()
//!     .generate(|writer| async move {
//!         for i in 0..=100 {
//!             if writer.write(i).await.is_err() {
//!                 break;
//!             }
//!         }
//!     })
//!     .mapper(|item, writer, cancel| async move {
//!         if item > 1_000 {
//!             cancel.cancel(anyhow::anyhow!("item {} out of range", item));
//!             return;
//!         }
//!         let _ = writer.write(item * item).await;
//!     })
//!     .reducer(|mut source, writer, _cancel| async move {
//!         let mut sum = 0;
//!         while let Some(v) = source.next().await {
//!             sum += v;
//!         }
//!         writer.write(sum);
//!     })
//!     .with_workers(8)
//!     .run()
//!     .await?;
//! ```
//!
//! ## Guarantees
//!
//! - **Backpressure** - both queues are bounded, so the generator and the
//!   mappers stall while downstream is saturated
//! - **Fan-in barrier** - the reducer's input closes only after every
//!   mapper worker has returned
//! - **No leaks** - `run` joins every task it spawns before returning, and
//!   dropping the `run` future cancels them
//! - **Panics are errors** - a panicking callback cancels the run with
//!   [`MapReduceError::Panicked`] naming the stage
//!
//! Intermediate values from different workers arrive in no particular
//! order, so reducers should be order-insensitive.

pub mod cancel;
pub mod error;
pub mod options;
pub mod pipeline;
pub mod recorder;
pub mod source;
mod worker;
pub mod writer;

pub use cancel::Canceller;
pub use error::{MapReduceError, Stage, WriteError};
pub use options::Options;
pub use pipeline::{for_each, MapReduce};
pub use recorder::{NoopRecorder, Recorder, RunId, RunStats, RunStatus};
pub use source::Source;
pub use writer::{ResultWriter, Writer};

pub use tokio_util::sync::CancellationToken;
