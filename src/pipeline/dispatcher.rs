//! Pair expansion and kernel submission.
//!
//! For one (task, chunk) the dispatcher expands the task's dispatch
//! sequence, resolves every channel to its row in the streamed range,
//! submits one kernel call per pair to the executor and hands back a gather
//! future. The future resolves once all pairs are done, with the results
//! stacked in dispatch order — the i-th row of the gathered array belongs to
//! the i-th pair. A single failing pair fails the whole (task, chunk).

use std::future::Future;
use std::sync::Arc;

use ndarray::ArrayD;

use crate::analysis::kernel::{kernel, AnalysisKind, KernelOpts, KernelResult};
use crate::analysis::task::AnalysisTask;
use crate::data::channel::ChannelRange;
use crate::data::chunk::FftChunk;
use crate::error::{DeltaError, Result};
use crate::pipeline::executor::Executor;

/// One task's stacked results for one chunk, ready for storage.
#[derive(Debug, Clone)]
pub struct GatheredResult {
    pub task_name: String,
    pub tidx: u64,
    /// Shape `[n_pairs, ...result shape]`.
    pub data: ArrayD<f64>,
}

impl GatheredResult {
    fn stack(task_name: String, tidx: u64, results: Vec<KernelResult>) -> Result<Self> {
        let item_shape = results
            .first()
            .map(KernelResult::shape)
            .ok_or_else(|| DeltaError::Kernel("empty gather".into()))?;
        let mut flat = Vec::with_capacity(
            results.len() * item_shape.iter().product::<usize>().max(1),
        );
        for result in &results {
            if result.shape() != item_shape {
                return Err(DeltaError::Kernel(format!(
                    "inconsistent result shapes in one gather: {:?} vs {:?}",
                    result.shape(),
                    item_shape
                )));
            }
            result.flatten_into(&mut flat);
        }
        let mut shape = vec![results.len()];
        shape.extend(&item_shape);
        let data = ArrayD::from_shape_vec(shape, flat)
            .map_err(|e| DeltaError::Kernel(format!("cannot stack gather: {e}")))?;
        Ok(Self {
            task_name,
            tidx,
            data,
        })
    }
}

pub struct Dispatcher {
    stream_range: ChannelRange,
}

impl Dispatcher {
    pub fn new(stream_range: ChannelRange) -> Self {
        Self { stream_range }
    }

    /// Checks that every channel a task names is present in the streamed
    /// range. Run once at startup so per-chunk dispatch cannot fail on
    /// channel resolution.
    pub fn validate(&self, task: &AnalysisTask) -> Result<()> {
        for range in [&task.ref_range, &task.cross_range] {
            for ch in range.iter() {
                if !self.stream_range.contains(&ch) {
                    return Err(DeltaError::Configuration(format!(
                        "task '{}' uses channel {ch} outside the streamed range {}",
                        task.name(),
                        self.stream_range
                    )));
                }
            }
        }
        Ok(())
    }

    /// Submits all pairs of `task` for one chunk and returns the gather
    /// future.
    pub fn submit(
        &self,
        task: &AnalysisTask,
        executor: &Executor,
        fft: Arc<FftChunk>,
        tidx: u64,
    ) -> Result<impl Future<Output = Result<GatheredResult>> + Send> {
        self.submit_with(task, executor, fft, tidx, kernel)
    }

    /// `submit` with a caller-provided kernel function. The tests use this
    /// to inject failures at chosen pairs.
    pub fn submit_with<K>(
        &self,
        task: &AnalysisTask,
        executor: &Executor,
        fft: Arc<FftChunk>,
        tidx: u64,
        kernel_fn: K,
    ) -> Result<impl Future<Output = Result<GatheredResult>> + Send>
    where
        K: Fn(AnalysisKind, &FftChunk, usize, usize, &KernelOpts) -> Result<KernelResult>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let pairs = task.dispatch_sequence();
        let mut futures = Vec::with_capacity(pairs.len());
        for (ref_ch, cross_ch) in &pairs {
            let ref_row = self.stream_range.position_of(ref_ch).ok_or_else(|| {
                DeltaError::Configuration(format!(
                    "channel {ref_ch} outside the streamed range {}",
                    self.stream_range
                ))
            })?;
            let cross_row = self.stream_range.position_of(cross_ch).ok_or_else(|| {
                DeltaError::Configuration(format!(
                    "channel {cross_ch} outside the streamed range {}",
                    self.stream_range
                ))
            })?;
            let fft = fft.clone();
            let kernel_fn = kernel_fn.clone();
            let kind = task.kind;
            let opts = task.opts;
            let pair = (ref_ch.to_string(), cross_ch.to_string());
            futures.push(executor.submit(move || {
                kernel_fn(kind, &fft, ref_row, cross_row, &opts).map_err(|e| {
                    DeltaError::Kernel(format!("pair ({}, {}): {e}", pair.0, pair.1))
                })
            }));
        }

        let task_name = task.name().to_string();
        Ok(async move {
            let results = Executor::gather(futures).await?;
            GatheredResult::stack(task_name, tidx, results)
        })
    }
}
