//! Short-time Fourier transform of one time-domain chunk.
//!
//! Each channel is cut into overlapping blocks of `nfft` samples spaced
//! `hop` apart; every block is detrended, windowed and transformed, and the
//! non-negative-frequency half of the spectrum is kept (`nfft/2 + 1` bins).
//! The result is a (channels × bins × blocks) complex cube.
//!
//! The transform is the CPU-heavy stage of the pipeline. It runs
//! single-threaded per chunk so its output is reproducible bit-for-bit by a
//! reference pass, which the regression tests rely on.

use std::sync::Arc;

use ndarray::Array3;
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::config::{DetrendKind, FftSettings, WindowKind};
use crate::data::chunk::{Chunk, FftChunk};
use crate::error::{DeltaError, Result};

/// Resolved transform parameters, derived from the `fft_params` config
/// section with the sampling rate filled in from the diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FftParams {
    pub nfft: usize,
    pub window: WindowKind,
    /// Samples between consecutive block starts.
    pub hop: usize,
    pub detrend: DetrendKind,
    /// Sampling rate in Hz.
    pub fsample: f64,
    pub normalize_scale: bool,
}

impl FftParams {
    pub fn from_settings(fft: &FftSettings, fsample: f64) -> Result<Self> {
        if fft.nfft == 0 {
            return Err(DeltaError::BadFftParams("nfft must be positive".into()));
        }
        if !(0.0..1.0).contains(&fft.overlap) {
            return Err(DeltaError::BadFftParams(format!(
                "overlap must be in [0, 1), got {}",
                fft.overlap
            )));
        }
        let hop = ((fft.nfft as f64) * (1.0 - fft.overlap)).round() as usize;
        if hop == 0 {
            return Err(DeltaError::BadFftParams(format!(
                "overlap {} leaves an empty hop for nfft {}",
                fft.overlap, fft.nfft
            )));
        }
        Ok(Self {
            nfft: fft.nfft,
            window: fft.window,
            hop,
            detrend: fft.detrend,
            fsample,
            normalize_scale: fft.normalize_scale,
        })
    }

    /// Number of retained Fourier bins, `nfft/2 + 1`.
    pub fn n_bins(&self) -> usize {
        self.nfft / 2 + 1
    }

    /// Number of blocks an `n_samples`-long chunk yields.
    pub fn n_blocks(&self, n_samples: usize) -> Result<usize> {
        if self.nfft > n_samples {
            return Err(DeltaError::BadFftParams(format!(
                "nfft {} exceeds the chunk length {}",
                self.nfft, n_samples
            )));
        }
        Ok((n_samples - self.nfft) / self.hop + 1)
    }

    /// Center frequency of bin `k`, in Hz.
    pub fn bin_freq(&self, k: usize) -> f64 {
        k as f64 * self.fsample / self.nfft as f64
    }

    pub fn window_coeffs(&self) -> Vec<f64> {
        let n = self.nfft;
        (0..n)
            .map(|i| {
                let x = 2.0 * std::f64::consts::PI * i as f64 / (n - 1) as f64;
                match self.window {
                    WindowKind::Hann => 0.5 * (1.0 - x.cos()),
                    WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowKind::Rect => 1.0,
                }
            })
            .collect()
    }
}

/// Reusable transform: FFT plan, window coefficients and scratch sizing are
/// set up once per run and applied to every chunk.
pub struct Stft {
    params: FftParams,
    plan: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    scale: f64,
}

impl Stft {
    pub fn new(params: FftParams) -> Self {
        let plan = FftPlanner::new().plan_fft_forward(params.nfft);
        let window = params.window_coeffs();
        let scale = if params.normalize_scale {
            1.0 / window.iter().map(|w| w * w).sum::<f64>().sqrt()
        } else {
            1.0
        };
        Self {
            params,
            plan,
            window,
            scale,
        }
    }

    pub fn params(&self) -> &FftParams {
        &self.params
    }

    /// Transforms one chunk. Fails with `BadFftParams` when the chunk is
    /// shorter than one block.
    pub fn transform(&self, chunk: &Chunk) -> Result<FftChunk> {
        let nfft = self.params.nfft;
        let n_blocks = self.params.n_blocks(chunk.n_samples())?;
        let n_bins = self.params.n_bins();

        let mut out = Array3::zeros((chunk.n_channels(), n_bins, n_blocks));
        let mut block = vec![0.0f64; nfft];
        let mut buf = vec![Complex64::default(); nfft];
        let mut scratch = vec![Complex64::default(); self.plan.get_inplace_scratch_len()];

        for (row, samples) in chunk.data().outer_iter().enumerate() {
            for b in 0..n_blocks {
                let start = b * self.params.hop;
                for (dst, src) in block.iter_mut().zip(samples.slice(ndarray::s![start..start + nfft])) {
                    *dst = *src;
                }
                detrend(&mut block, self.params.detrend);
                for (i, (x, w)) in block.iter().zip(self.window.iter()).enumerate() {
                    buf[i] = Complex64::new(x * w * self.scale, 0.0);
                }
                self.plan.process_with_scratch(&mut buf, &mut scratch);
                for k in 0..n_bins {
                    out[[row, k, b]] = buf[k];
                }
            }
        }

        Ok(FftChunk::new(out, *chunk.timebase(), self.params.clone()))
    }
}

fn detrend(block: &mut [f64], kind: DetrendKind) {
    match kind {
        DetrendKind::None => {}
        DetrendKind::Constant => {
            let mean = block.iter().sum::<f64>() / block.len() as f64;
            for x in block.iter_mut() {
                *x -= mean;
            }
        }
        DetrendKind::Linear => {
            let (alpha, beta) = linear_fit(block);
            for (i, x) in block.iter_mut().enumerate() {
                *x -= alpha + beta * i as f64;
            }
        }
    }
}

/// Least-squares line `y = alpha + beta * i` over the block.
fn linear_fit(block: &[f64]) -> (f64, f64) {
    let n = block.len() as f64;
    let mut xsum = 0.0;
    let mut ysum = 0.0;
    let mut xsqsum = 0.0;
    let mut prodsum = 0.0;
    for (i, y) in block.iter().enumerate() {
        let x = i as f64;
        xsum += x;
        ysum += y;
        xsqsum += x * x;
        prodsum += x * y;
    }
    let beta = (n * prodsum - xsum * ysum) / (n * xsqsum - xsum * xsum);
    let alpha = ysum / n - beta * xsum / n;
    (alpha, beta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::timebase::TimeBase;
    use ndarray::Array2;

    fn params(nfft: usize, window: WindowKind, detrend: DetrendKind) -> FftParams {
        FftParams {
            nfft,
            window,
            hop: nfft / 2,
            detrend,
            fsample: 1e3,
            normalize_scale: false,
        }
    }

    fn tone_chunk(n_samples: usize, freq: f64, phase: f64) -> Chunk {
        let tb = TimeBase::new(0.0, 1.0, 1e3, n_samples, 0);
        let data = Array2::from_shape_fn((1, n_samples), |(_, i)| {
            (2.0 * std::f64::consts::PI * freq * i as f64 / 1e3 + phase).cos()
        });
        Chunk::new(data, tb).unwrap()
    }

    #[test]
    fn block_count_follows_the_stride() {
        let p = params(256, WindowKind::Hann, DetrendKind::None);
        assert_eq!(p.n_blocks(1024).unwrap(), 7);
        assert_eq!(p.n_blocks(256).unwrap(), 1);
        assert!(p.n_blocks(255).is_err());
    }

    #[test]
    fn output_dimensions_match_the_parameters() {
        let stft = Stft::new(params(64, WindowKind::Hann, DetrendKind::None));
        let chunk = tone_chunk(256, 125.0, 0.0);
        let fft = stft.transform(&chunk).unwrap();
        assert_eq!(fft.n_channels(), 1);
        assert_eq!(fft.n_bins(), 33);
        assert_eq!(fft.n_blocks(), 7);
    }

    #[test]
    fn tone_lands_in_its_bin() {
        // 125 Hz at 1 kHz sampling with nfft 64: bin 8 exactly.
        let stft = Stft::new(params(64, WindowKind::Rect, DetrendKind::None));
        let chunk = tone_chunk(256, 125.0, 0.0);
        let fft = stft.transform(&chunk).unwrap();
        let ch = fft.channel(0);
        let power_at = |k: usize| (0..fft.n_blocks()).map(|b| ch[[k, b]].norm_sqr()).sum::<f64>();
        let peak = power_at(8);
        for k in [0, 2, 4, 6, 12, 20, 30] {
            assert!(power_at(k) < peak * 1e-12, "leakage at bin {k}");
        }
        assert_eq!(stft.params().bin_freq(8), 125.0);
    }

    #[test]
    fn constant_detrend_kills_the_dc_bin() {
        let stft = Stft::new(params(64, WindowKind::Rect, DetrendKind::Constant));
        let tb = TimeBase::new(0.0, 1.0, 1e3, 128, 0);
        let data = Array2::from_elem((1, 128), 7.5);
        let chunk = Chunk::new(data, tb).unwrap();
        let fft = stft.transform(&chunk).unwrap();
        let ch = fft.channel(0);
        for b in 0..fft.n_blocks() {
            assert!(ch[[0, b]].norm() < 1e-10);
        }
    }

    #[test]
    fn linear_detrend_removes_a_ramp() {
        let stft = Stft::new(params(64, WindowKind::Rect, DetrendKind::Linear));
        let tb = TimeBase::new(0.0, 1.0, 1e3, 128, 0);
        let data = Array2::from_shape_fn((1, 128), |(_, i)| 0.25 * i as f64 - 3.0);
        let chunk = Chunk::new(data, tb).unwrap();
        let fft = stft.transform(&chunk).unwrap();
        let ch = fft.channel(0);
        for k in 0..fft.n_bins() {
            for b in 0..fft.n_blocks() {
                assert!(ch[[k, b]].norm() < 1e-8, "residual at bin {k}");
            }
        }
    }

    #[test]
    fn normalize_scale_divides_by_window_energy() {
        let mut p = params(64, WindowKind::Hann, DetrendKind::None);
        let chunk = tone_chunk(64, 125.0, 0.0);
        let raw = Stft::new(p.clone()).transform(&chunk).unwrap();
        p.normalize_scale = true;
        let scaled = Stft::new(p.clone()).transform(&chunk).unwrap();
        let wsum: f64 = p.window_coeffs().iter().map(|w| w * w).sum();
        let k = 8;
        let expected = raw.channel(0)[[k, 0]] / wsum.sqrt();
        let got = scaled.channel(0)[[k, 0]];
        assert!((expected - got).norm() < 1e-12);
    }

    #[test]
    fn rejects_chunks_shorter_than_one_block() {
        let stft = Stft::new(params(512, WindowKind::Hann, DetrendKind::None));
        let chunk = tone_chunk(256, 125.0, 0.0);
        assert!(matches!(
            stft.transform(&chunk),
            Err(DeltaError::BadFftParams(_))
        ));
    }

    #[test]
    fn linear_fit_recovers_a_line() {
        let block: Vec<f64> = (0..32).map(|i| 2.0 + 0.5 * i as f64).collect();
        let (alpha, beta) = linear_fit(&block);
        assert!((alpha - 2.0).abs() < 1e-9);
        assert!((beta - 0.5).abs() < 1e-9);
    }
}
