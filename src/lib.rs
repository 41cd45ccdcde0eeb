//! # Delta
//!
//! Streaming spectral analysis for KSTAR ECEI fusion-diagnostic data.
//!
//! A *generator* process replays an archived shot chunk-wise over a
//! stepwise pub/sub transport; a *processor* process receives the stream,
//! normalizes each chunk against a warm-up window, applies a short-time
//! Fourier transform and fans a configurable list of cross-channel spectral
//! analyses out over a bounded worker pool, writing results and run
//! metadata to a pluggable storage backend.
//!
//! ## Crate structure
//!
//! - **`config`** — the frozen per-run [`config::Settings`] tree and its
//!   validation.
//! - **`context`** — the process-wide [`context::RunContext`].
//! - **`data`** — channels and ranges, the streaming time-base, chunk
//!   carriers and the warm-up normalizer.
//! - **`analysis`** — the STFT and the closed set of analysis kernels with
//!   their dispatch-sequence bookkeeping.
//! - **`pipeline`** — receiver → bounded queue → consumer → executor, with
//!   the sentinel-terminated drain.
//! - **`transport`** — the stepwise stream contracts and the built-in
//!   engines.
//! - **`source`** — the chunk-wise archive loader feeding the generator.
//! - **`storage`** — the numpy / mongo / null backends behind one
//!   capability set.
//! - **`generator`**, **`processor`** — the two application drivers behind
//!   the `delta` binary.

pub mod analysis;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod processor;
pub mod source;
pub mod storage;
pub mod transport;

pub use context::RunContext;
pub use error::{DeltaError, Result};
