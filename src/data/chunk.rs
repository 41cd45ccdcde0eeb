//! Time-domain and frequency-domain chunk carriers.
//!
//! A [`Chunk`] is one (channels × samples) frame received from the stream,
//! paired with its time-base. It is owned exclusively by whichever pipeline
//! stage currently processes it and is only ever mutated by the normalizer's
//! in-place path. The STFT stage turns it into an [`FftChunk`]
//! (channels × bins × blocks, complex), which is shared read-only by all
//! analysis kernels dispatched for that chunk and dropped when the last of
//! them completes.

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2};
use num_complex::Complex64;

use crate::analysis::stft::FftParams;
use crate::config::DiagnosticSettings;
use crate::data::timebase::TimeBase;
use crate::error::{DeltaError, Result};

/// One (C × N) time-domain frame of the diagnostic stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Array2<f64>,
    timebase: TimeBase,
}

impl Chunk {
    pub fn new(data: Array2<f64>, timebase: TimeBase) -> Result<Self> {
        if data.ncols() != timebase.samples_per_chunk {
            return Err(DeltaError::Transport(format!(
                "frame has {} samples per channel, time-base expects {}",
                data.ncols(),
                timebase.samples_per_chunk
            )));
        }
        Ok(Self { data, timebase })
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    pub(crate) fn data_mut(&mut self) -> ArrayViewMut2<'_, f64> {
        self.data.view_mut()
    }

    /// (channels, samples)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn timebase(&self) -> &TimeBase {
        &self.timebase
    }
}

/// The STFT of one chunk: a (C × F × B) complex matrix, where F is the
/// number of Fourier bins and B the number of short-time blocks.
#[derive(Debug)]
pub struct FftChunk {
    data: Array3<Complex64>,
    timebase: TimeBase,
    params: FftParams,
}

impl FftChunk {
    pub fn new(data: Array3<Complex64>, timebase: TimeBase, params: FftParams) -> Self {
        Self {
            data,
            timebase,
            params,
        }
    }

    /// The (F × B) spectrum block of one channel row.
    pub fn channel(&self, row: usize) -> ArrayView2<'_, Complex64> {
        self.data.index_axis(ndarray::Axis(0), row)
    }

    pub fn n_channels(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn n_bins(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn n_blocks(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn timebase(&self) -> &TimeBase {
        &self.timebase
    }

    pub fn params(&self) -> &FftParams {
        &self.params
    }
}

/// Stamps raw stream frames into [`Chunk`]s with the acquisition's
/// time-base. One factory per run, configured from the diagnostic section.
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    template: TimeBase,
    n_channels: usize,
}

impl ChunkFactory {
    pub fn new(diag: &DiagnosticSettings, n_channels: usize) -> Self {
        let [t_start, t_end, _] = diag.parameters.trigger_time;
        let template = TimeBase::new(
            t_start,
            t_end,
            diag.parameters.f_sample(),
            diag.datasource.chunk_size,
            0,
        );
        Self {
            template,
            n_channels,
        }
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    pub fn samples_per_chunk(&self) -> usize {
        self.template.samples_per_chunk
    }

    /// Wraps one streamed frame, received at step `chunk_idx`, into a chunk.
    pub fn new_chunk(&self, data: Array2<f64>, chunk_idx: u64) -> Result<Chunk> {
        if data.nrows() != self.n_channels {
            return Err(DeltaError::Transport(format!(
                "frame has {} channels, expected {}",
                data.nrows(),
                self.n_channels
            )));
        }
        Chunk::new(data, self.template.for_chunk(chunk_idx))
    }
}
