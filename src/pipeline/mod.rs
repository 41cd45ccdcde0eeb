//! The streaming-analysis pipeline.
//!
//! Two long-lived activities cooperate through one bounded FIFO queue:
//!
//! - the **receiver** pulls framed chunks off the transport in step order,
//!   drops everything before the normalizer arms, normalizes the rest in
//!   place and enqueues `(tidx, chunk)` messages — blocking when the queue
//!   is full, which back-pressures the transport;
//! - the **consumer** dequeues, runs the STFT, and for every configured
//!   task submits the pair kernels to the executor, attaching a
//!   continuation that hands the gathered rows to storage. It never waits
//!   for one chunk's tasks before starting the next; `tidx` keys the
//!   ordering that storage observes.
//!
//! The sentinel message is the only termination signal. On end-of-stream
//! (or transport error, or a stop request) the receiver enqueues it and
//! exits; the consumer finishes submitting, drains the outstanding
//! continuations and shuts the executor down with wait semantics.
//!
//! Chunk lifecycle: received → dropped-pre-warmup, or received → normalized
//! → queued → transformed → dispatched → stored/failed. Kernel failures are
//! confined to their (task, chunk) gather; the run continues with the next
//! chunk.

pub mod dispatcher;
pub mod executor;

pub use dispatcher::{Dispatcher, GatheredResult};
pub use executor::Executor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use ndarray::Array2;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;

use crate::analysis::kernel::{kernel, AnalysisKind, KernelOpts, KernelResult};
use crate::analysis::stft::Stft;
use crate::analysis::task::AnalysisTask;
use crate::config::ProcessorSettings;
use crate::data::chunk::{Chunk, ChunkFactory, FftChunk};
use crate::data::normalizer::Normalizer;
use crate::error::{DeltaError, Result};
use crate::storage::StorageBackend;
use crate::transport::{StepStatus, StreamReader};

/// The kernel function the consumer dispatches pairs through. Production
/// uses [`crate::analysis::kernel::kernel`]; tests substitute failure
/// injections.
pub type KernelFn = Arc<
    dyn Fn(AnalysisKind, &FftChunk, usize, usize, &KernelOpts) -> Result<KernelResult>
        + Send
        + Sync,
>;

/// Queue message; the sentinel is the only termination signal.
enum Message {
    Chunk { tidx: u64, chunk: Chunk },
    Sentinel,
}

/// Counters reported at the end of a run and asserted by the tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Chunks read off the transport.
    pub received: u64,
    /// Chunks dropped before the normalizer armed.
    pub dropped_prewarmup: u64,
    /// Chunks transformed and dispatched.
    pub processed: u64,
    /// (task, chunk) gathers submitted.
    pub dispatched: u64,
    /// (task, chunk) results delivered to storage.
    pub stored: u64,
    /// (task, chunk) gathers that failed in a kernel.
    pub kernel_failures: u64,
    /// Results lost to storage errors.
    pub storage_failures: u64,
    /// Times the receiver found the queue full and had to wait.
    pub producer_blocked: u64,
}

enum Outcome {
    Stored,
    KernelFailed,
    StoreFailed,
}

pub struct Pipeline {
    factory: ChunkFactory,
    normalizer: Normalizer,
    stft: Arc<Stft>,
    tasks: Arc<Vec<AnalysisTask>>,
    dispatcher: Arc<Dispatcher>,
    executor: Executor,
    storage: Arc<dyn StorageBackend>,
    kernel_fn: KernelFn,
    queue_capacity: usize,
    throttle: std::time::Duration,
    run_id: String,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: ChunkFactory,
        normalizer: Normalizer,
        stft: Stft,
        tasks: Vec<AnalysisTask>,
        dispatcher: Dispatcher,
        executor: Executor,
        storage: Arc<dyn StorageBackend>,
        processor: &ProcessorSettings,
        run_id: String,
    ) -> Self {
        Self {
            factory,
            normalizer,
            stft: Arc::new(stft),
            tasks: Arc::new(tasks),
            dispatcher: Arc::new(dispatcher),
            executor,
            storage,
            kernel_fn: Arc::new(kernel),
            queue_capacity: processor.queue_capacity.max(2),
            throttle: std::time::Duration::from_millis(processor.chunk_delay_ms),
            run_id,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replaces the analysis kernel for every dispatched pair. The failure
    /// tests use this to poison chosen pairs.
    pub fn with_kernel(mut self, kernel_fn: KernelFn) -> Self {
        self.kernel_fn = kernel_fn;
        self
    }

    /// Handle that makes the receiver stop after the chunk it is currently
    /// reading and drain the pipeline.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs the pipeline over `reader` until end-of-stream and drains.
    /// `var_name` is the framed variable to read each step.
    pub async fn run(
        self,
        reader: Box<dyn StreamReader + Send>,
        var_name: String,
    ) -> Result<PipelineStats> {
        let (tx, mut rx) = mpsc::channel::<Message>(self.queue_capacity);

        let factory = self.factory.clone();
        let normalizer = self.normalizer.clone();
        let run_id = self.run_id.clone();
        let stop = self.stop.clone();
        let producer = tokio::task::spawn_blocking(move || {
            receiver_loop(reader, var_name, factory, normalizer, tx, stop, &run_id)
        });

        let mut stats = PipelineStats::default();
        let mut continuations: JoinSet<Outcome> = JoinSet::new();

        loop {
            if !self.throttle.is_zero() {
                tokio::time::sleep(self.throttle).await;
            }
            let (tidx, chunk) = match rx.recv().await {
                None | Some(Message::Sentinel) => break,
                Some(Message::Chunk { tidx, chunk }) => (tidx, chunk),
            };

            let stft = self.stft.clone();
            let fft = match tokio::task::spawn_blocking(move || stft.transform(&chunk)).await {
                Ok(Ok(fft)) => Arc::new(fft),
                Ok(Err(e)) => {
                    error!(
                        "run_id={} tidx={tidx} transform failed, skipping chunk: {e}",
                        self.run_id
                    );
                    continue;
                }
                Err(e) => {
                    error!(
                        "run_id={} tidx={tidx} transform panicked, skipping chunk: {e}",
                        self.run_id
                    );
                    continue;
                }
            };
            stats.processed += 1;

            for task in self.tasks.iter() {
                let kernel_fn = self.kernel_fn.clone();
                let gather =
                    match self.dispatcher.submit_with(
                        task,
                        &self.executor,
                        fft.clone(),
                        tidx,
                        move |kind, fft, i, j, opts| kernel_fn(kind, fft, i, j, opts),
                    ) {
                        Ok(gather) => gather,
                        Err(e) => {
                            error!(
                                "run_id={} task={} tidx={tidx} dispatch failed: {e}",
                                self.run_id,
                                task.name()
                            );
                            stats.kernel_failures += 1;
                            continue;
                        }
                    };
                stats.dispatched += 1;

                let storage = self.storage.clone();
                let run_id = self.run_id.clone();
                let task_name = task.name();
                continuations.spawn(async move {
                    match gather.await {
                        Ok(result) => {
                            let info = serde_json::json!({});
                            match storage
                                .store_result(&result.task_name, result.tidx, &result.data, info)
                                .await
                            {
                                Ok(()) => Outcome::Stored,
                                Err(e) => {
                                    // The result is lost; the run continues.
                                    error!(
                                        "run_id={run_id} task={task_name} tidx={tidx} \
                                         store failed: {e}"
                                    );
                                    Outcome::StoreFailed
                                }
                            }
                        }
                        Err(e) => {
                            error!(
                                "run_id={run_id} task={task_name} tidx={tidx} kernel failed, \
                                 dropping chunk results: {e}"
                            );
                            Outcome::KernelFailed
                        }
                    }
                });
            }

            // Reap whatever finished without waiting on anything.
            while let Some(done) = continuations.try_join_next() {
                tally(&mut stats, done);
            }
        }

        // Sentinel seen: everything is submitted, drain the continuations
        // and then the executor.
        while let Some(done) = continuations.join_next().await {
            tally(&mut stats, done);
        }
        self.executor.shutdown().await;

        let (received, dropped, blocked, transport_error) = producer
            .await
            .map_err(|e| DeltaError::Transport(format!("receiver thread died: {e}")))?;
        stats.received = received;
        stats.dropped_prewarmup = dropped;
        stats.producer_blocked = blocked;

        info!(
            "run_id={} drained: received={} dropped_prewarmup={} processed={} stored={} \
             kernel_failures={} storage_failures={}",
            self.run_id,
            stats.received,
            stats.dropped_prewarmup,
            stats.processed,
            stats.stored,
            stats.kernel_failures,
            stats.storage_failures
        );

        match transport_error {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

fn tally(stats: &mut PipelineStats, done: std::result::Result<Outcome, tokio::task::JoinError>) {
    match done {
        Ok(Outcome::Stored) => stats.stored += 1,
        Ok(Outcome::KernelFailed) => stats.kernel_failures += 1,
        Ok(Outcome::StoreFailed) | Err(_) => stats.storage_failures += 1,
    }
}

/// Receiver loop, running on a blocking thread for the life of the stream.
/// Always enqueues the sentinel on the way out; returns
/// (received, dropped, blocked, transport error).
fn receiver_loop(
    mut reader: Box<dyn StreamReader + Send>,
    var_name: String,
    factory: ChunkFactory,
    mut normalizer: Normalizer,
    tx: mpsc::Sender<Message>,
    stop: Arc<AtomicBool>,
    run_id: &str,
) -> (u64, u64, u64, Option<DeltaError>) {
    let mut received = 0u64;
    let mut dropped = 0u64;
    let mut blocked = 0u64;
    let mut rx_list: Vec<u64> = Vec::new();

    let fail = |e: DeltaError| {
        error!("run_id={run_id} transport failure, draining: {e}");
        Some(e)
    };

    // Blocks until the generator side exists; this thread is the only one
    // allowed to wait on transport I/O.
    if let Err(e) = reader.open() {
        let transport_error = fail(e);
        let _ = tx.blocking_send(Message::Sentinel);
        return (received, dropped, blocked, transport_error);
    }

    let transport_error = loop {
        if stop.load(Ordering::SeqCst) {
            info!("run_id={run_id} stop requested, ending receiver");
            break None;
        }
        let tidx = match reader.begin_step() {
            Ok(StepStatus::Step(tidx)) => tidx,
            Ok(StepStatus::EndOfStream) => {
                info!("run_id={run_id} transport end of stream");
                break None;
            }
            Err(e) => break fail(e),
        };

        let var = match reader.inquire_variable(&var_name) {
            Ok(var) => var,
            Err(e) => break fail(e),
        };
        if var.shape.len() != 2 {
            break fail(DeltaError::Transport(format!(
                "variable '{var_name}' is {}-dimensional, expected (channels, samples)",
                var.shape.len()
            )));
        }
        let mut frame = vec![0.0f64; var.len()];
        if let Err(e) = reader.get(&var_name, &mut frame) {
            break fail(e);
        }
        let data = match Array2::from_shape_vec((var.shape[0], var.shape[1]), frame) {
            Ok(data) => data,
            Err(e) => break fail(DeltaError::Transport(format!("bad frame layout: {e}"))),
        };
        let mut chunk = match factory.new_chunk(data, tidx) {
            Ok(chunk) => chunk,
            Err(e) => break fail(e),
        };
        received += 1;
        rx_list.push(tidx);

        if !normalizer.observe(&chunk) {
            info!("run_id={run_id} dropped pre-warmup chunk tidx={tidx}");
            dropped += 1;
            if let Err(e) = reader.end_step() {
                break fail(e);
            }
            continue;
        }
        if let Err(e) = normalizer.apply(&mut chunk) {
            break fail(e);
        }

        match tx.try_send(Message::Chunk { tidx, chunk }) {
            Ok(()) => {}
            Err(TrySendError::Full(back)) => {
                // Queue full: block until the consumer catches up.
                blocked += 1;
                if tx.blocking_send(back).is_err() {
                    break None;
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("run_id={run_id} consumer is gone, ending receiver");
                break None;
            }
        }

        if let Err(e) = reader.end_step() {
            break fail(e);
        }
    };

    let _ = tx.blocking_send(Message::Sentinel);
    info!("run_id={run_id} received time chunks {rx_list:?}");
    (received, dropped, blocked, transport_error)
}
