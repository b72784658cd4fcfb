//! Periodic metric collection.
//!
//! A [`SamplingWorker`] runs one command on an interval, parses the output
//! with a [`Parser`] and keeps the last samples in a [`SampleQueue`]. The
//! [`WorkerPool`] owns all workers and stops them on shutdown.

mod pool;
mod queue;
mod sample;
mod worker;

pub use pool::WorkerPool;
pub use queue::SampleQueue;
pub use sample::{KeyValueParser, Parser, Sample, raw_payload};
pub use worker::{CommandSource, SamplingWorker, WorkerConfig, WorkerExit, WorkerState};
