//! Per-channel normalization against a warm-up window.
//!
//! The raw ECEI voltages carry a per-channel DC offset that must be
//! estimated from a quiet interval `[t_norm0, t_norm1]` before the plasma
//! heats up. The [`Normalizer`] watches incoming chunks until one overlaps
//! that interval with at least [`MIN_NORM_SAMPLES`] samples, computes the
//! per-channel offset (median) and standard deviation over the window, and
//! arms itself. Arming is monotonic: once armed the offsets are frozen for
//! the rest of the run.
//!
//! Chunks seen before arming are dropped by the receiver; chunks seen after
//! are normalized in place. Downstream analyses therefore never observe a
//! mix of raw and normalized data.

use ndarray::{Array1, ArrayView1};

use crate::data::chunk::Chunk;
use crate::error::{DeltaError, Result};

/// Minimum number of warm-up samples required to estimate the offsets.
pub const MIN_NORM_SAMPLES: usize = 100;

#[derive(Debug, Clone)]
pub struct Normalizer {
    t_norm: (f64, f64),
    offset: Option<Array1<f64>>,
    std: Option<Array1<f64>>,
}

impl Normalizer {
    pub fn new(t_norm0: f64, t_norm1: f64) -> Self {
        Self {
            t_norm: (t_norm0, t_norm1),
            offset: None,
            std: None,
        }
    }

    pub fn armed(&self) -> bool {
        self.offset.is_some()
    }

    /// Per-channel offset standard deviation over the warm-up window.
    /// Available once armed; recorded for diagnostics.
    pub fn offset_std(&self) -> Option<ArrayView1<'_, f64>> {
        self.std.as_ref().map(|s| s.view())
    }

    /// Inspects a chunk for warm-up data. If the normalizer is not yet armed
    /// and the chunk contains at least [`MIN_NORM_SAMPLES`] samples inside
    /// the warm-up window, computes the per-channel offsets and arms.
    ///
    /// Returns whether the normalizer is armed after the call.
    pub fn observe(&mut self, chunk: &Chunk) -> bool {
        if self.armed() {
            return true;
        }

        let tb = chunk.timebase();
        let in_window: Vec<usize> = (0..chunk.n_samples())
            .filter(|&i| {
                let t = tb.sample_to_time(i);
                t >= self.t_norm.0 && t <= self.t_norm.1
            })
            .collect();
        if in_window.len() < MIN_NORM_SAMPLES {
            return false;
        }

        let data = chunk.data();
        let mut offset = Array1::zeros(chunk.n_channels());
        let mut std = Array1::zeros(chunk.n_channels());
        let mut window = Vec::with_capacity(in_window.len());
        for (row, data_row) in data.outer_iter().enumerate() {
            window.clear();
            window.extend(in_window.iter().map(|&i| data_row[i]));
            offset[row] = median(&mut window);
            std[row] = std_dev(&window);
        }
        self.offset = Some(offset);
        self.std = Some(std);
        true
    }

    /// Normalizes a chunk in place: each sample becomes
    /// `(x - offset) / mean(x) - 1`, with `mean(x)` the channel's mean over
    /// the time axis of the *raw* samples.
    ///
    /// Requires an armed normalizer whose offset vector matches the chunk's
    /// channel count.
    pub fn apply(&self, chunk: &mut Chunk) -> Result<()> {
        let offset = self
            .offset
            .as_ref()
            .ok_or_else(|| DeltaError::Configuration("normalizer applied before arming".into()))?;
        if offset.len() != chunk.n_channels() {
            return Err(DeltaError::Configuration(format!(
                "normalizer has {} channels, chunk has {}",
                offset.len(),
                chunk.n_channels()
            )));
        }

        let mut data = chunk.data_mut();
        for (row, mut data_row) in data.outer_iter_mut().enumerate() {
            let mean = data_row.mean().unwrap_or(0.0);
            data_row.mapv_inplace(|x| (x - offset[row]) / mean - 1.0);
        }
        Ok(())
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn std_dev(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}
