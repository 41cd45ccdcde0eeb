//! Spectral analysis: the short-time Fourier transform and the
//! cross-channel kernels dispatched per chunk.

pub mod kernel;
pub mod stft;
pub mod task;

pub use kernel::{kernel, AnalysisKind, KernelOpts, KernelResult};
pub use stft::{FftParams, Stft};
pub use task::{serialize_dispatch_seq, AnalysisTask, DispatchSeqEntry};
