//! Cross-channel analysis kernels.
//!
//! Every analysis is a pure function of one frequency-domain chunk and a
//! (reference, cross) channel pair. The closed [`AnalysisKind`] set replaces
//! name-to-callable dispatch: a kind that does not parse is rejected at
//! startup, long before the stream opens.
//!
//! Cross-spectra follow the cross-spectral-density convention with the
//! conjugate on the reference channel, `P_xy(f) = mean_B(conj(X) * Y)`, so
//! a cross channel lagging the reference by `phi` reports a cross-phase of
//! `-phi`.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayView2};
use num_complex::Complex64;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::analysis::stft::FftParams;
use crate::data::chunk::FftChunk;
use crate::error::{DeltaError, Result};

/// The closed set of cross-channel analyses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    CrossPower,
    CrossPhase,
    Coherence,
    CrossCorrelation,
    Bicoherence,
    Skw,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisKind::CrossPower => "cross_power",
            AnalysisKind::CrossPhase => "cross_phase",
            AnalysisKind::Coherence => "coherence",
            AnalysisKind::CrossCorrelation => "cross_correlation",
            AnalysisKind::Bicoherence => "bicoherence",
            AnalysisKind::Skw => "skw",
        }
    }
}

impl fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisKind {
    type Err = DeltaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cross_power" => Ok(AnalysisKind::CrossPower),
            "cross_phase" => Ok(AnalysisKind::CrossPhase),
            "coherence" => Ok(AnalysisKind::Coherence),
            "cross_correlation" => Ok(AnalysisKind::CrossCorrelation),
            "bicoherence" => Ok(AnalysisKind::Bicoherence),
            "skw" => Ok(AnalysisKind::Skw),
            _ => Err(DeltaError::UnknownAnalysis(s.to_string())),
        }
    }
}

/// Per-task kernel options, taken from the task's kwargs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KernelOpts {
    /// Keep the frequency axis of pairwise spectra instead of collapsing
    /// over it.
    pub per_bin: bool,
    /// Wavenumber bins of the spectral-wavenumber estimate.
    pub nk: usize,
    /// Channel separation entering the local wavenumber, in array units.
    pub dz: f64,
}

impl Default for KernelOpts {
    fn default() -> Self {
        Self {
            per_bin: false,
            nk: 64,
            dz: 1.0,
        }
    }
}

/// A kernel result, variant over the shapes the analyses produce.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelResult {
    Scalar(f64),
    Vector(Array1<f64>),
    Matrix(Array2<f64>),
}

impl KernelResult {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            KernelResult::Scalar(_) => vec![],
            KernelResult::Vector(v) => vec![v.len()],
            KernelResult::Matrix(m) => m.shape().to_vec(),
        }
    }

    /// Appends the result in row-major order to `out`.
    pub fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            KernelResult::Scalar(x) => out.push(*x),
            KernelResult::Vector(v) => out.extend(v.iter()),
            KernelResult::Matrix(m) => out.extend(m.iter()),
        }
    }
}

/// The result shape a kind produces under the given transform parameters.
/// Declared up front so storage can pre-allocate per chunk.
pub fn result_shape(kind: AnalysisKind, params: &FftParams, opts: &KernelOpts) -> Vec<usize> {
    let n_bins = params.n_bins();
    match kind {
        AnalysisKind::CrossPower | AnalysisKind::CrossPhase | AnalysisKind::Coherence => {
            if opts.per_bin {
                vec![n_bins]
            } else {
                vec![]
            }
        }
        AnalysisKind::CrossCorrelation => vec![params.nfft],
        AnalysisKind::Bicoherence => vec![n_bins, n_bins],
        AnalysisKind::Skw => vec![n_bins, opts.nk],
    }
}

/// Computes one analysis for one (reference, cross) channel pair of a chunk.
pub fn kernel(
    kind: AnalysisKind,
    fft: &FftChunk,
    ref_row: usize,
    cross_row: usize,
    opts: &KernelOpts,
) -> Result<KernelResult> {
    let n_channels = fft.n_channels();
    if ref_row >= n_channels || cross_row >= n_channels {
        return Err(DeltaError::Kernel(format!(
            "channel pair ({ref_row}, {cross_row}) outside the {n_channels}-channel chunk"
        )));
    }
    let x = fft.channel(ref_row);
    let y = fft.channel(cross_row);

    match kind {
        AnalysisKind::CrossPower => {
            if opts.per_bin {
                Ok(KernelResult::Vector(cross_spectrum(&x, &y).mapv(|c| c.norm())))
            } else {
                Ok(KernelResult::Scalar(flat_mean(&x, &y).norm()))
            }
        }
        AnalysisKind::CrossPhase => {
            if opts.per_bin {
                Ok(KernelResult::Vector(
                    cross_spectrum(&x, &y).mapv(|c| c.im.atan2(c.re)),
                ))
            } else {
                let c = flat_mean(&x, &y);
                Ok(KernelResult::Scalar(c.im.atan2(c.re)))
            }
        }
        AnalysisKind::Coherence => {
            if opts.per_bin {
                Ok(KernelResult::Vector(coherence_bins(&x, &y)))
            } else {
                Ok(KernelResult::Scalar(coherence_flat(&x, &y)))
            }
        }
        AnalysisKind::CrossCorrelation => cross_correlation(&x, &y, fft.params().nfft),
        AnalysisKind::Bicoherence => Ok(bicoherence(&x, &y)),
        AnalysisKind::Skw => skw(&x, &y, opts),
    }
}

/// `mean_B(conj(X) * Y)` per frequency bin.
fn cross_spectrum(x: &ArrayView2<'_, Complex64>, y: &ArrayView2<'_, Complex64>) -> Array1<Complex64> {
    let (n_bins, n_blocks) = x.dim();
    let mut out = Array1::zeros(n_bins);
    for f in 0..n_bins {
        let mut acc = Complex64::default();
        for b in 0..n_blocks {
            acc += x[[f, b]].conj() * y[[f, b]];
        }
        out[f] = acc / n_blocks as f64;
    }
    out
}

/// Mean of `conj(X) * Y` over the flattened (bin, block) axes, the collapse
/// the scalar result forms use.
fn flat_mean(x: &ArrayView2<'_, Complex64>, y: &ArrayView2<'_, Complex64>) -> Complex64 {
    let mut acc = Complex64::default();
    for (a, b) in x.iter().zip(y.iter()) {
        acc += a.conj() * b;
    }
    acc / x.len() as f64
}

/// `|mean_B(conj(X) * Y / sqrt(|X|^2 |Y|^2)).re|` per frequency bin.
fn coherence_bins(x: &ArrayView2<'_, Complex64>, y: &ArrayView2<'_, Complex64>) -> Array1<f64> {
    let (n_bins, n_blocks) = x.dim();
    let mut out = Array1::zeros(n_bins);
    for f in 0..n_bins {
        let mut acc = Complex64::default();
        for b in 0..n_blocks {
            let denom = (x[[f, b]].norm_sqr() * y[[f, b]].norm_sqr()).sqrt();
            if denom > 0.0 {
                acc += x[[f, b]].conj() * y[[f, b]] / denom;
            }
        }
        out[f] = (acc / n_blocks as f64).re.abs();
    }
    out
}

/// Scalar coherence: the normalized cross-terms averaged over the flattened
/// (bin, block) axes before taking `|re|`.
fn coherence_flat(x: &ArrayView2<'_, Complex64>, y: &ArrayView2<'_, Complex64>) -> f64 {
    let mut acc = Complex64::default();
    for (a, b) in x.iter().zip(y.iter()) {
        let denom = (a.norm_sqr() * b.norm_sqr()).sqrt();
        if denom > 0.0 {
            acc += a.conj() * b / denom;
        }
    }
    (acc / x.len() as f64).re.abs()
}

/// Real part of the inverse transform of the block-averaged cross-spectrum.
/// The retained half-spectrum is Hermitian-extended back to `nfft` bins, so
/// the result has one value per lag in `[0, nfft)`.
fn cross_correlation(
    x: &ArrayView2<'_, Complex64>,
    y: &ArrayView2<'_, Complex64>,
    nfft: usize,
) -> Result<KernelResult> {
    let spectrum = cross_spectrum(x, y);
    let n_bins = spectrum.len();

    let mut full = vec![Complex64::default(); nfft];
    full[..n_bins].copy_from_slice(spectrum.as_slice().ok_or_else(|| {
        DeltaError::Kernel("cross-spectrum buffer is not contiguous".into())
    })?);
    for f in 1..nfft - n_bins + 1 {
        full[nfft - f] = spectrum[f].conj();
    }

    let plan = FftPlanner::new().plan_fft_inverse(nfft);
    plan.process(&mut full);
    let scale = 1.0 / nfft as f64;
    Ok(KernelResult::Vector(
        full.iter().map(|c| c.re * scale).collect(),
    ))
}

/// `|mean_B(X(f1) X(f2) conj(Y(f1+f2)))|^2` normalized by the block-averaged
/// powers of the two factors. Bins with `f1 + f2` beyond the spectrum, or
/// with vanishing power, are zero.
fn bicoherence(x: &ArrayView2<'_, Complex64>, y: &ArrayView2<'_, Complex64>) -> KernelResult {
    let (n_bins, n_blocks) = x.dim();
    let mut out = Array2::zeros((n_bins, n_bins));
    for f1 in 0..n_bins {
        for f2 in 0..n_bins {
            let f3 = f1 + f2;
            if f3 >= n_bins {
                continue;
            }
            let mut b = Complex64::default();
            let mut p1 = 0.0;
            let mut p2 = 0.0;
            for blk in 0..n_blocks {
                let prod = x[[f1, blk]] * x[[f2, blk]];
                b += prod * y[[f3, blk]].conj();
                p1 += prod.norm_sqr();
                p2 += y[[f3, blk]].norm_sqr();
            }
            let denom = (p1 / n_blocks as f64) * (p2 / n_blocks as f64);
            if denom > 0.0 {
                out[[f1, f2]] = (b / n_blocks as f64).norm_sqr() / denom;
            }
        }
    }
    KernelResult::Matrix(out)
}

/// Local-wavenumber spectral density S(f, k): per block and bin, the phase
/// difference between the pair divided by the channel separation gives a
/// wavenumber in `[-pi/dz, pi/dz]`, and the pair's mean power is histogrammed
/// into `nk` bins along that axis.
fn skw(
    x: &ArrayView2<'_, Complex64>,
    y: &ArrayView2<'_, Complex64>,
    opts: &KernelOpts,
) -> Result<KernelResult> {
    if opts.nk == 0 {
        return Err(DeltaError::Kernel("skw requires at least one k bin".into()));
    }
    if opts.dz <= 0.0 {
        return Err(DeltaError::Kernel(format!(
            "skw channel separation must be positive, got {}",
            opts.dz
        )));
    }
    let (n_bins, n_blocks) = x.dim();
    let k_max = std::f64::consts::PI / opts.dz;
    let mut out = Array2::zeros((n_bins, opts.nk));
    for f in 0..n_bins {
        for b in 0..n_blocks {
            let cross = x[[f, b]].conj() * y[[f, b]];
            if cross.norm_sqr() == 0.0 {
                continue;
            }
            let k = cross.arg() / opts.dz;
            let pos = (k + k_max) / (2.0 * k_max) * opts.nk as f64;
            let bin = (pos.floor() as usize).min(opts.nk - 1);
            let power = 0.5 * (x[[f, b]].norm_sqr() + y[[f, b]].norm_sqr());
            out[[f, bin]] += power / n_blocks as f64;
        }
    }
    Ok(KernelResult::Matrix(out))
}
